use log::error;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::AcmeError;

/// Released once by whoever owns the work; every waiter wakes up.
#[derive(Debug, Default)]
pub struct Signal(CancellationToken);

impl Signal {
    pub async fn wait(&self) {
        self.0.cancelled().await
    }

    pub fn is_released(&self) -> bool {
        self.0.is_cancelled()
    }

    fn release(&self) {
        self.0.cancel()
    }
}

/// Owner side of a key. Dropping it removes the key and releases the waiters, however the
/// owner got there.
#[derive(Debug)]
pub struct WorkClaim {
    tracker: Arc<WorkTracker>,
    key: String,
}

impl WorkClaim {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for WorkClaim {
    fn drop(&mut self) {
        if let Err(e) = self.tracker.remove(&self.key) {
            error!("failed to release {}. {}", self.key, e);
        }
    }
}

pub enum Claimed {
    Owner(WorkClaim),
    Busy(Arc<Signal>),
}

/// Keys currently being worked on, at most one owner per key.
#[derive(Debug, Default)]
pub struct WorkTracker {
    working: Mutex<HashMap<String, Arc<Signal>>>,
}

impl WorkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(true, signal)` if someone else already owns `key`; wait on the signal then.
    pub fn add(&self, key: &str) -> (bool, Arc<Signal>) {
        let mut working = self.working.lock().unwrap_or_else(|e| e.into_inner());
        match working.get(key) {
            Some(signal) => (true, signal.clone()),
            None => {
                let signal = Arc::new(Signal::default());
                working.insert(key.to_string(), signal.clone());
                (false, signal)
            }
        }
    }

    /// Like `add`, but the owner gets a guard instead of having to call `remove`.
    pub fn claim(self: &Arc<Self>, key: &str) -> Claimed {
        match self.add(key) {
            (true, signal) => Claimed::Busy(signal),
            (false, _) => Claimed::Owner(WorkClaim {
                tracker: Arc::clone(self),
                key: key.to_string(),
            }),
        }
    }

    pub fn remove(&self, key: &str) -> Result<(), AcmeError> {
        let signal = self.working.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        match signal {
            Some(s) => {
                s.release();
                Ok(())
            }
            None => AcmeError::tip(&format!("{} is not being worked on", key)),
        }
    }

    pub fn len(&self) -> usize {
        self.working.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
