use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::jws::Payload;
use super::{AccountKey, AcmeClient, Identifier, Problem};
use crate::AcmeError;

pub const TYPE_HTTP_01: &str = "http-01";
pub const TYPE_DNS_01: &str = "dns-01";
const DNS_CHALLENGE_PREFIX: &str = "_acme-challenge.";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum ChallengeType {
    Http01,
    Dns01,
    /// anything else the server offers, kept so the authorization still decodes
    Other(String),
}

impl From<String> for ChallengeType {
    fn from(s: String) -> Self {
        match s.as_str() {
            TYPE_HTTP_01 => ChallengeType::Http01,
            TYPE_DNS_01 => ChallengeType::Dns01,
            _ => ChallengeType::Other(s),
        }
    }
}

impl From<ChallengeType> for String {
    fn from(t: ChallengeType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeType::Http01 => f.write_str(TYPE_HTTP_01),
            ChallengeType::Dns01 => f.write_str(TYPE_DNS_01),
            ChallengeType::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    pub url: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub validated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<Problem>,
}

impl Challenge {
    /// Name and content of the resource the server will look up.
    ///
    /// http-01: (token, key authorization). dns-01: (`_acme-challenge.<domain>`, digest).
    pub fn validation_resource(&self, identifier: &Identifier, key: &AccountKey) -> Result<(String, String), AcmeError> {
        if !identifier.is_dns() {
            return Err(AcmeError::Validation(format!("unsupported identifier type {}", identifier.kind)));
        }
        match &self.kind {
            ChallengeType::Http01 => Ok((self.token.clone(), key.key_authorization(&self.token)?)),
            ChallengeType::Dns01 => {
                let domain = identifier.value.trim_start_matches("*.");
                Ok((format!("{}{}", DNS_CHALLENGE_PREFIX, domain), key.key_authorization_digest(&self.token)?))
            }
            ChallengeType::Other(t) => Err(AcmeError::Validation(format!("unsupported challenge type {}", t))),
        }
    }
}

impl AcmeClient {
    /// Tells the server the resource is in place.
    pub async fn validate_challenge(&self, url: &str, key: &AccountKey) -> Result<Challenge, AcmeError> {
        let res = self.post(url, &Payload::Json(serde_json::json!({})), key).await?;
        Ok(serde_json::from_slice(&res.body)?)
    }

    pub async fn get_challenge(&self, url: &str, key: &AccountKey) -> Result<Challenge, AcmeError> {
        let res = self.post_as_get(url, key).await?;
        Ok(serde_json::from_slice(&res.body)?)
    }
}
