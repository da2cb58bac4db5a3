use log::trace;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};

use crate::{acme::AuthorizationStatus, AcmeError};

const AUTH_TTL: Duration = Duration::from_secs(30);

struct Entry {
    status: AuthorizationStatus,
    error: Option<String>,
    generation: u64,
    expires_at: Instant,
    expirer: JoinHandle<()>,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

/// Last outcome per authorization url, kept for a short while so waiters can pick it up.
pub struct AuthCache {
    ttl: Duration,
    generation: AtomicU64,
    entries: Entries,
}

impl Default for AuthCache {
    fn default() -> Self {
        Self::new(AUTH_TTL)
    }
}

impl AuthCache {
    pub fn new(ttl: Duration) -> Self {
        AuthCache {
            ttl,
            generation: AtomicU64::new(0),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replaces any earlier outcome for `url`; the earlier expiry is aborted.
    pub fn add(&self, url: &str, status: AuthorizationStatus, error: Option<String>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = entries.remove(url) {
            old.expirer.abort();
        }

        let expirer = {
            let entries = self.entries.clone();
            let url = url.to_string();
            let ttl = self.ttl;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());
                if entries.get(&url).is_some_and(|e| e.generation == generation) {
                    entries.remove(&url);
                    trace!("auth cache entry {} expired", url);
                }
            })
        };
        entries.insert(
            url.to_string(),
            Entry {
                status,
                error,
                generation,
                expires_at: Instant::now() + self.ttl,
                expirer,
            },
        );
    }

    pub fn read(&self, url: &str) -> Result<(AuthorizationStatus, Option<String>), AcmeError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(url) {
            Some(e) if e.expires_at > Instant::now() => Ok((e.status, e.error.clone())),
            _ => AcmeError::tip(&format!("auth cache has no entry for {}", url)),
        }
    }
}

impl Drop for AuthCache {
    fn drop(&mut self) {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for e in entries.values() {
            e.expirer.abort();
        }
    }
}
