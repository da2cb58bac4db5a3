//! Exponential backoff with jitter, bounded by a total elapsed budget.

use log::debug;
use rand::Rng;
use std::{fmt, future::Future, time::Duration};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::AcmeError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
    /// +- fraction applied to every wait
    pub randomization: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

/// How a retried operation ended without succeeding.
#[derive(Debug)]
pub enum RetryError<E> {
    /// the budget ran out, carrying the last error
    Exhausted(E),
    Cancelled,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted(e) => write!(f, "retries exhausted: {}", e),
            RetryError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<RetryError<AcmeError>> for AcmeError {
    fn from(e: RetryError<AcmeError>) -> Self {
        match e {
            RetryError::Exhausted(e) => e,
            RetryError::Cancelled => AcmeError::Shutdown,
        }
    }
}

impl Backoff {
    /// Waiting for a txt record to show up on every resolver.
    pub fn dns_propagation() -> Self {
        Backoff {
            initial: Duration::from_secs(15),
            multiplier: 1.2,
            randomization: 0.2,
            max_interval: Duration::from_secs(120),
            max_elapsed: Duration::from_secs(30 * 60),
        }
    }

    /// Polling orders and challenges.
    pub fn acme() -> Self {
        Backoff {
            initial: Duration::from_secs(7),
            multiplier: 1.4,
            randomization: 0.4,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(10 * 60),
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(current.as_secs_f64() * self.multiplier).min(self.max_interval)
    }

    fn jittered(&self, interval: Duration) -> Duration {
        if self.randomization <= 0.0 {
            return interval;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.randomization..=1.0 + self.randomization);
        Duration::from_secs_f64(interval.as_secs_f64() * factor)
    }

    /// Runs `op` until it succeeds, the elapsed budget is spent, or `cancel` fires.
    pub async fn retry<T, E, F, Fut>(&self, cancel: &CancellationToken, label: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let start = Instant::now();
        let mut interval = self.initial;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(t) => return Ok(t),
                Err(e) => e,
            };

            let wait = self.jittered(interval);
            if start.elapsed() + wait > self.max_elapsed {
                debug!("{}: giving up after {} attempts. {}", label, attempt, err);
                return Err(RetryError::Exhausted(err));
            }
            debug!("{}: attempt {} failed, retry in {:.1}s. {}", label, attempt, wait.as_secs_f32(), err);

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = sleep(wait) => {}
            }
            interval = self.next_interval(interval);
        }
    }
}
