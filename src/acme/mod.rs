//! rfc8555 protocol client.
//!
//! One `AcmeClient` talks to one acme server. It owns the directory snapshot and the nonce pool,
//! and signs every request with the caller's `AccountKey`.

use log::{debug, warn};
use std::sync::Arc;

use crate::{AcmeError, HttpClient, HttpResponse, HEADER_CONTENT_TYPE, HEADER_LOCATION, HEADER_REPLAY_NONCE};

mod account;
mod authorization;
mod certificate;
mod challenge;
mod directory;
mod jws;
mod nonce;
mod order;
mod problem;
mod renewal_info;

#[cfg(test)]
pub(crate) mod mock;
#[cfg(test)]
pub(crate) use certificate::test_certs;

pub use account::{Account, AccountStatus, NewAccount, UpdateAccount};
pub use authorization::{Authorization, AuthorizationStatus};
pub use certificate::{CertificateChain, RevocationReason};
pub use challenge::{Challenge, ChallengeStatus, ChallengeType};
pub use directory::{Directory, DirectoryManager, DirectoryMeta, RefreshIntervals};
pub use jws::{AccountKey, Eab, Jwk, KeyAlg, KeyPair, Payload, SignedMessage};
pub use nonce::NonceManager;
pub use order::{Identifier, Order, OrderStatus};
pub use problem::{Problem, CONTENT_TYPE_PROBLEM, ERROR_BAD_NONCE};
pub use renewal_info::{RenewalInfo, SuggestedWindow};

use jws::Protected;

const MAX_SIGNED_ATTEMPTS: u8 = 4;

#[derive(Debug)]
pub struct AcmeClient {
    http: HttpClient,
    directory: Arc<DirectoryManager>,
    nonces: NonceManager,
}

impl AcmeClient {
    pub async fn new(directory_url: &str) -> Result<Self, AcmeError> {
        Self::with_http(HttpClient::new()?, directory_url).await
    }

    pub async fn with_http(http: HttpClient, directory_url: &str) -> Result<Self, AcmeError> {
        let directory = DirectoryManager::new(http.clone(), directory_url).await?;
        Ok(AcmeClient {
            nonces: NonceManager::new(http.clone()),
            directory: Arc::new(directory),
            http,
        })
    }

    pub fn directory(&self) -> Arc<Directory> {
        self.directory.snapshot()
    }

    pub fn directory_manager(&self) -> &Arc<DirectoryManager> {
        &self.directory
    }

    pub fn nonces(&self) -> &NonceManager {
        &self.nonces
    }

    /// Unauthenticated GET, classified like any acme response.
    pub async fn get(&self, url: &str) -> Result<HttpResponse, AcmeError> {
        let res = self.http.get(url).await?;
        self.nonces.save_nonce(&res.header(HEADER_REPLAY_NONCE).unwrap_or_default());
        check_response(url, &res)?;
        Ok(res)
    }

    pub(crate) async fn post_as_get(&self, url: &str, key: &AccountKey) -> Result<HttpResponse, AcmeError> {
        self.post(url, &Payload::Empty, key).await
    }

    /// Signed POST. A `badNonce` answer is retried with a fresh nonce and a fresh signature,
    /// at most `MAX_SIGNED_ATTEMPTS` times. Every other error ends the loop.
    pub(crate) async fn post(&self, url: &str, payload: &Payload<'_>, key: &AccountKey) -> Result<HttpResponse, AcmeError> {
        let payload64 = payload.encode()?;
        let mut nonce = self.nonces.nonce(&self.directory().new_nonce).await?;
        let mut attempts: u8 = 0;
        loop {
            attempts += 1;
            let protected = Protected::from_key(url, key, Some(nonce))?;
            let body = jws::SignedMessage::sign(&protected, &payload64, key)?.to_json()?;
            let res = self.http.post_jose(url, body).await?;
            let fresh = res.header(HEADER_REPLAY_NONCE);

            match check_response(url, &res) {
                Err(AcmeError::Problem(p)) if p.is_bad_nonce() && attempts < MAX_SIGNED_ATTEMPTS => {
                    debug!("badNonce from {}, retry {}/{}", url, attempts, MAX_SIGNED_ATTEMPTS);
                    nonce = match fresh {
                        Some(n) => n,
                        None => {
                            warn!("badNonce response from {} carries no {}", url, HEADER_REPLAY_NONCE);
                            self.nonces.nonce(&self.directory().new_nonce).await?
                        }
                    };
                }
                result => {
                    self.nonces.save_nonce(&fresh.unwrap_or_default());
                    return result.map(|_| res);
                }
            }
        }
    }
}

// media type without parameters, lowercased
pub(crate) fn media_type(res: &HttpResponse) -> String {
    res.header(HEADER_CONTENT_TYPE)
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
        .unwrap_or_default()
}

pub(crate) fn location(res: &HttpResponse) -> Option<String> {
    res.header(HEADER_LOCATION)
}

/// Problem documents become `AcmeError::Problem`, other non-2xx answers `AcmeError::Status`.
pub(crate) fn check_response(url: &str, res: &HttpResponse) -> Result<(), AcmeError> {
    let is_problem = media_type(res) == CONTENT_TYPE_PROBLEM;
    if is_problem || !res.is_success() {
        if let Ok(mut p) = serde_json::from_slice::<Problem>(&res.body) {
            if is_problem || !p.kind.is_empty() {
                if p.status == 0 {
                    p.status = res.status;
                }
                return Err(AcmeError::Problem(p));
            }
        }
    }
    if !res.is_success() {
        return Err(AcmeError::Status {
            url: url.to_string(),
            code: res.status,
        });
    }
    Ok(())
}
