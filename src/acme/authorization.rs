use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::jws::Payload;
use super::{AccountKey, AcmeClient, Challenge, ChallengeType, Identifier};
use crate::AcmeError;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    /// Every status except `pending` is terminal for fulfillment.
    pub fn is_final(&self) -> bool {
        !matches!(self, AuthorizationStatus::Pending)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    pub fn challenge(&self, kind: &ChallengeType) -> Option<&Challenge> {
        self.challenges.iter().find(|c| &c.kind == kind)
    }
}

#[derive(Serialize)]
struct Deactivate {
    status: AuthorizationStatus,
}

impl AcmeClient {
    pub async fn get_authorization(&self, url: &str, key: &AccountKey) -> Result<Authorization, AcmeError> {
        let res = self.post_as_get(url, key).await?;
        Ok(serde_json::from_slice(&res.body)?)
    }

    pub async fn deactivate_authorization(&self, url: &str, key: &AccountKey) -> Result<Authorization, AcmeError> {
        let payload = Payload::json(&Deactivate {
            status: AuthorizationStatus::Deactivated,
        })?;
        let res = self.post(url, &payload, key).await?;
        Ok(serde_json::from_slice(&res.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::jws::test_keys::P256_SEC1;
    use super::super::mock::{MockAcme, MockResponse};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fetch_and_deactivate() {
        let mock = MockAcme::start().await;
        mock.on("/authz/1", |req| {
            let status = if req.payload.is_null() { "pending" } else { "deactivated" };
            MockResponse::json(
                200,
                json!({
                    "identifier": {"type": "dns", "value": "example.com"},
                    "status": status,
                    "wildcard": true,
                    "challenges": [
                        {"type": "dns-01", "url": "https://ca/chall/1", "status": "pending", "token": "t1"},
                        {"type": "tls-alpn-01", "url": "https://ca/chall/2", "status": "pending", "token": "t2"}
                    ]
                }),
            )
        });
        let client = AcmeClient::new(&mock.directory_url()).await.unwrap();
        let key = AccountKey::from_pem(P256_SEC1).unwrap().with_kid("https://ca/acct/1");

        let authz = client.get_authorization(&mock.url("/authz/1"), &key).await.unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Pending);
        assert!(authz.wildcard);
        assert_eq!(authz.challenge(&ChallengeType::Dns01).map(|c| c.token.as_str()), Some("t1"));
        assert!(authz.challenge(&ChallengeType::Http01).is_none());
        assert_eq!(authz.challenges[1].kind, ChallengeType::Other("tls-alpn-01".to_string()));

        let authz = client.deactivate_authorization(&mock.url("/authz/1"), &key).await.unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Deactivated);
        assert_eq!(mock.requests("/authz/1")[1].payload, json!({"status": "deactivated"}));
    }

    #[test]
    fn only_pending_is_not_final() {
        assert!(!AuthorizationStatus::Pending.is_final());
        assert!(AuthorizationStatus::Valid.is_final());
        assert!(AuthorizationStatus::Revoked.is_final());
    }
}
