//! Drives authorizations to a final state, one worker per authorization url.

mod cache;
mod working;

use futures::future::join_all;
use log::{debug, error, info};
use std::sync::Arc;

use crate::acme::{AccountKey, AcmeClient, AuthorizationStatus};
use crate::challenges::Challenges;
use crate::AcmeError;

pub use cache::AuthCache;
pub use working::{Claimed, Signal, WorkClaim, WorkTracker};

pub struct Fulfiller {
    challenges: Arc<Challenges>,
    working: Arc<WorkTracker>,
    cache: AuthCache,
}

impl Fulfiller {
    pub fn new(challenges: Arc<Challenges>) -> Self {
        Fulfiller {
            challenges,
            working: Arc::new(WorkTracker::new()),
            cache: AuthCache::default(),
        }
    }

    pub fn challenges(&self) -> &Arc<Challenges> {
        &self.challenges
    }

    /// Works every authorization concurrently. Fails if any of them could not be brought to a
    /// final status; an `invalid` authorization alone is not a failure here.
    pub async fn fulfill_auths(&self, urls: &[String], key: &AccountKey, client: &AcmeClient) -> Result<(), AcmeError> {
        let results = join_all(urls.iter().map(|url| self.fulfill_auth(url, key, client))).await;
        let mut errors: Vec<AcmeError> = results.into_iter().filter_map(|r| r.err()).collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(AcmeError::Validation(
                errors.iter().map(|e| e.to_string()).collect::<Vec<String>>().join("; "),
            )),
        }
    }

    pub async fn fulfill_auth(&self, url: &str, key: &AccountKey, client: &AcmeClient) -> Result<AuthorizationStatus, AcmeError> {
        // an owner that is dropped midway releases the url without an outcome, a waiter
        // then finds nothing cached and takes over
        let claim = loop {
            let signal = match self.working.claim(url) {
                Claimed::Owner(claim) => break claim,
                Claimed::Busy(signal) => signal,
            };
            debug!("auth {} is being worked elsewhere, waiting", url);
            signal.wait().await;
            if let Ok((status, error)) = self.cache.read(url) {
                return match error {
                    None => Ok(status),
                    Some(e) => Err(AcmeError::Validation(format!("auth {} failed: {}", url, e))),
                };
            }
        };

        let res = self.work(url, key, client).await;
        match &res {
            Ok(status) => self.cache.add(url, *status, None),
            Err(e) => {
                error!("auth {} failed. {}", url, e);
                self.cache.add(url, AuthorizationStatus::Pending, Some(e.to_string()));
            }
        }
        drop(claim);
        res
    }

    async fn work(&self, url: &str, key: &AccountKey, client: &AcmeClient) -> Result<AuthorizationStatus, AcmeError> {
        let mut auth = client.get_authorization(url, key).await?;
        if auth.status == AuthorizationStatus::Pending {
            self.challenges.solve(&auth.identifier, &auth.challenges, key, client).await?;
            auth = client.get_authorization(url, key).await?;
        }
        if !auth.status.is_final() {
            return Err(AcmeError::Validation(format!("auth {} status ({:?}) is not final", url, auth.status)));
        }
        info!("auth {} for {} is {:?}", url, auth.identifier.value, auth.status);
        Ok(auth.status)
    }
}
