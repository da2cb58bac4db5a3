use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use super::jws::Payload;
use super::{location, AccountKey, AcmeClient, Problem};
use crate::{crypt::base64, AcmeError};

pub const IDENTIFIER_DNS: &str = "dns";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Identifier {
            kind: IDENTIFIER_DNS.to_string(),
            value: value.into(),
        }
    }

    pub fn is_dns(&self) -> bool {
        self.kind == IDENTIFIER_DNS
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<Problem>,
    /// not part of the body, taken from the `Location` header
    #[serde(skip)]
    pub location: String,
}

#[derive(Serialize)]
struct NewOrder<'a> {
    identifiers: &'a [Identifier],
}

#[derive(Serialize)]
struct Finalize {
    csr: String,
}

impl AcmeClient {
    pub async fn new_order(&self, identifiers: &[Identifier], key: &AccountKey) -> Result<Order, AcmeError> {
        let url = self.directory().new_order.clone();
        let res = self.post(&url, &Payload::json(&NewOrder { identifiers })?, key).await?;
        let mut order: Order = serde_json::from_slice(&res.body)?;
        order.location = match location(&res) {
            Some(l) => l,
            None => return Err(AcmeError::Validation("newOrder response has no Location".to_string())),
        };
        debug!("Order {} is {:?}", order.location, order.status);
        Ok(order)
    }

    pub async fn get_order(&self, url: &str, key: &AccountKey) -> Result<Order, AcmeError> {
        let res = self.post_as_get(url, key).await?;
        let mut order: Order = serde_json::from_slice(&res.body)?;
        order.location = location(&res).unwrap_or_else(|| url.to_string());
        Ok(order)
    }

    /// `location` stays empty when the server does not echo the order url.
    pub async fn finalize_order(&self, url: &str, csr_der: &[u8], key: &AccountKey) -> Result<Order, AcmeError> {
        let payload = Payload::json(&Finalize { csr: base64(csr_der) })?;
        let res = self.post(url, &payload, key).await?;
        let mut order: Order = serde_json::from_slice(&res.body)?;
        order.location = location(&res).unwrap_or_default();
        Ok(order)
    }
}
