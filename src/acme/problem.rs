use serde::{Deserialize, Serialize};
use std::fmt;

pub const ERROR_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
pub const CONTENT_TYPE_PROBLEM: &str = "application/problem+json";

/// rfc7807 problem document, the body of every acme error response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Problem {
    #[serde(default)]
    pub status: u16,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<Problem>,
}

impl Problem {
    pub fn new(status: u16, kind: &str, detail: &str) -> Self {
        Problem {
            status,
            kind: kind.to_string(),
            detail: detail.to_string(),
            subproblems: Vec::new(),
        }
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.kind == ERROR_BAD_NONCE
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acme problem {} ({}): {}", self.kind, self.status, self.detail)?;
        for sub in &self.subproblems {
            write!(f, "; {}: {}", sub.kind, sub.detail)?;
        }
        Ok(())
    }
}
