use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::jws::{Eab, Payload, Protected, SignedMessage};
use super::{location, AccountKey, AcmeClient};
use crate::AcmeError;

const TIP_REQUIRED_EAB: &str = "The acme server requires external account binding, add eab_kid and eab_key";
const TIP_NO_KID: &str = "Account key has no kid, register the account first";

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub status: AccountStatus,
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default)]
    pub terms_of_service_agreed: Option<bool>,
    #[serde(default)]
    pub orders: Option<String>,
    /// account url from the `Location` header, used as kid from here on
    #[serde(skip)]
    pub location: String,
}

#[derive(Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub only_return_existing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_binding: Option<SignedMessage>,
}

impl NewAccount {
    pub fn with_email(email: Option<&str>) -> Self {
        NewAccount {
            contact: email.map(|e| vec![format!("mailto:{}", e)]).unwrap_or_default(),
            terms_of_service_agreed: true,
            ..Default::default()
        }
    }
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct UpdateAccount {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountStatus>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyChange<'a> {
    account: &'a str,
    old_key: super::Jwk,
}

impl AcmeClient {
    /// Registers (or looks up) the account of `key`. The returned location is the kid.
    pub async fn new_account(&self, payload: &NewAccount, eab: Option<&Eab>, key: &AccountKey) -> Result<Account, AcmeError> {
        let dir = self.directory();
        let mut payload = payload.clone();
        match eab {
            Some(eab) => payload.external_account_binding = Some(eab.binding(key, &dir.new_account)?),
            None if dir.meta.external_account_required => return Err(AcmeError::Validation(TIP_REQUIRED_EAB.to_string())),
            None => {}
        }

        let res = self.post(&dir.new_account, &Payload::json(&payload)?, &key.without_kid()).await?;
        let mut account: Account = serde_json::from_slice(&res.body)?;
        account.location = match location(&res) {
            Some(l) => l,
            None => return Err(AcmeError::Validation("newAccount response has no Location".to_string())),
        };
        info!("Account {} ({})", account.location, if res.status == 201 { "created" } else { "existing" });
        Ok(account)
    }

    pub async fn update_account(&self, payload: &UpdateAccount, key: &AccountKey) -> Result<Account, AcmeError> {
        let kid = key.kid().ok_or_else(|| AcmeError::Validation(TIP_NO_KID.to_string()))?;
        let res = self.post(kid, &Payload::json(payload)?, key).await?;
        let mut account: Account = serde_json::from_slice(&res.body)?;
        account.location = location(&res).unwrap_or_else(|| kid.to_string());
        Ok(account)
    }

    pub async fn deactivate_account(&self, key: &AccountKey) -> Result<Account, AcmeError> {
        let payload = UpdateAccount {
            status: Some(AccountStatus::Deactivated),
            ..Default::default()
        };
        self.update_account(&payload, key).await
    }

    /// rfc8555 s7.3.5. Returns `new_key` carrying the account kid.
    pub async fn rollover_key(&self, key: &AccountKey, new_key: &AccountKey) -> Result<AccountKey, AcmeError> {
        let kid = key.kid().ok_or_else(|| AcmeError::Validation(TIP_NO_KID.to_string()))?;
        let url = match &self.directory().key_change {
            Some(u) => u.clone(),
            None => return Err(AcmeError::Validation("directory has no keyChange".to_string())),
        };

        let new_key = new_key.without_kid();
        let inner_payload = Payload::json(&KeyChange {
            account: kid,
            old_key: key.jwk()?,
        })?
        .encode()?;
        let inner = SignedMessage::sign(&Protected::from_jwk(&url, &new_key)?, &inner_payload, &new_key)?;
        debug!("Key change for {}", kid);

        self.post(&url, &Payload::Signed(&inner), key).await?;
        Ok(new_key.with_kid(kid))
    }
}
