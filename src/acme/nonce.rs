use log::warn;
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use crate::{AcmeError, HttpClient, HEADER_REPLAY_NONCE, HEADER_RETRY_AFTER};

const POOL_CAPACITY: usize = 32;
const MAX_FETCH_TRY: u8 = 5;
const FETCH_RETRY_DEFAULT: Duration = Duration::from_secs(5);

/// Shared pool of anti-replay nonces, refilled from every response.
///
/// Each nonce leaves the pool exactly once, so concurrent signed requests never share one.
#[derive(Debug)]
pub struct NonceManager {
    http: HttpClient,
    pool: Mutex<VecDeque<String>>,
}

impl NonceManager {
    pub fn new(http: HttpClient) -> Self {
        NonceManager {
            http,
            pool: Mutex::new(VecDeque::with_capacity(POOL_CAPACITY)),
        }
    }

    fn pool(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pops the oldest pooled nonce, or asks `new_nonce_url` for a fresh one.
    pub async fn nonce(&self, new_nonce_url: &str) -> Result<String, AcmeError> {
        if let Some(nonce) = self.pool().pop_front() {
            return Ok(nonce);
        }
        self.fetch(new_nonce_url).await
    }

    pub fn save_nonce(&self, nonce: &str) {
        if nonce.is_empty() {
            return;
        }
        let mut pool = self.pool();
        if pool.len() >= POOL_CAPACITY {
            pool.pop_front();
        }
        pool.push_back(nonce.to_string());
    }

    pub fn len(&self) -> usize {
        self.pool().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn fetch(&self, url: &str) -> Result<String, AcmeError> {
        let mut attempts: u8 = 0;
        loop {
            attempts += 1;
            let res = self.http.head(url).await?;
            if let Some(nonce) = res.header(HEADER_REPLAY_NONCE) {
                return Ok(nonce);
            }
            if attempts >= MAX_FETCH_TRY {
                return Err(AcmeError::Validation(format!("no {} header from {} after {} tries", HEADER_REPLAY_NONCE, url, attempts)));
            }
            let wait = res
                .header(HEADER_RETRY_AFTER)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(FETCH_RETRY_DEFAULT);
            warn!("Missing nonce from {} (status {}), retry {}/{} in {:?}", url, res.status, attempts, MAX_FETCH_TRY, wait);
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::mock::MockAcme;

    #[test]
    fn empty_nonce_is_ignored() {
        let nonces = NonceManager::new(HttpClient::new().unwrap());
        nonces.save_nonce("");
        assert!(nonces.is_empty());
    }

    #[test]
    fn ring_evicts_oldest() {
        let nonces = NonceManager::new(HttpClient::new().unwrap());
        for i in 0..POOL_CAPACITY + 3 {
            nonces.save_nonce(&format!("n{}", i));
        }
        assert_eq!(nonces.len(), POOL_CAPACITY);
        assert_eq!(nonces.pool().front().map(String::as_str), Some("n3"));
    }

    #[tokio::test]
    async fn pops_pool_before_fetching() {
        let mock = MockAcme::start().await;
        let nonces = NonceManager::new(HttpClient::new().unwrap());
        nonces.save_nonce("pooled");
        assert_eq!(nonces.nonce(&mock.url("/new-nonce")).await.unwrap(), "pooled");

        let fetched = nonces.nonce(&mock.url("/new-nonce")).await.unwrap();
        assert!(fetched.starts_with("mock-nonce-"));
        assert!(nonces.is_empty());
    }
}
