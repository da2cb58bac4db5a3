//! Decides whether a dns record is visible from a set of public resolvers.

mod check;
mod resolver;

use futures::future::join_all;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, RetryError};
use crate::AcmeError;
use check::{evaluate, FUNCTIONING_REQUIREMENT, PROPAGATION_REQUIREMENT};
use resolver::ResolverPair;

pub use resolver::DnsServiceIpPair;

const FALLBACK_SKIP_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsRecordType {
    Txt,
    Cname,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DnsCheckerConfig {
    /// when set, records are not looked up; the checker sleeps this long instead
    pub skip_check_wait_seconds: Option<u64>,
    pub dns_services: Vec<DnsServiceIpPair>,
}

pub struct DnsChecker {
    skip_wait: Option<Duration>,
    resolvers: Vec<ResolverPair>,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl DnsChecker {
    pub fn new(cfg: &DnsCheckerConfig, cancel: CancellationToken) -> Self {
        let mut checker = DnsChecker {
            skip_wait: None,
            resolvers: Vec::new(),
            backoff: Backoff::dns_propagation(),
            cancel,
        };

        if let Some(secs) = cfg.skip_check_wait_seconds {
            warn!("dns record validation disabled, will sleep {}s instead", secs);
            checker.skip_wait = Some(Duration::from_secs(secs));
            return checker;
        }

        let resolvers: Result<Vec<ResolverPair>, AcmeError> = cfg.dns_services.iter().map(ResolverPair::new).collect();
        match resolvers {
            Ok(r) if !r.is_empty() => {
                debug!("dns services: {:?}", cfg.dns_services);
                checker.resolvers = r;
            }
            Ok(_) => {
                warn!("No dns services configured, will sleep {}s instead of validating dns records", FALLBACK_SKIP_SECS);
                checker.skip_wait = Some(Duration::from_secs(FALLBACK_SKIP_SECS));
            }
            Err(e) => {
                error!(
                    "Configure dns resolvers failed ({}), will sleep {}s instead of validating dns records",
                    e, FALLBACK_SKIP_SECS
                );
                checker.skip_wait = Some(Duration::from_secs(FALLBACK_SKIP_SECS));
            }
        }
        checker
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_skipping(&self) -> bool {
        self.skip_wait.is_some()
    }

    /// One pass over every service. In skip mode this sleeps and reports the record as present.
    pub async fn check_record(&self, fqdn: &str, value: &str, kind: DnsRecordType) -> Result<bool, AcmeError> {
        if let Some(wait) = self.skip_wait {
            debug!("Skip checking {}, sleep {}s", fqdn, wait.as_secs());
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(AcmeError::Shutdown),
                _ = tokio::time::sleep(wait) => return Ok(true),
            }
        }

        let results = join_all(self.resolvers.iter().map(|r| async move {
            let res = r.check(fqdn, value, kind).await;
            if let Err(e) = &res {
                error!("Check {} failed. {}", fqdn, e);
            }
            res
        }))
        .await;
        evaluate(fqdn, &results, FUNCTIONING_REQUIREMENT, PROPAGATION_REQUIREMENT)
    }

    /// Keeps checking until the txt record is everywhere or the backoff budget is spent.
    pub async fn check_txt_with_retry(&self, fqdn: &str, value: &str) -> Result<bool, AcmeError> {
        let label = format!("txt {}", fqdn);
        let res = self
            .backoff
            .retry(&self.cancel, &label, move || async move {
                match self.check_record(fqdn, value, DnsRecordType::Txt).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(AcmeError::Propagation(format!("{} not propagated yet", fqdn))),
                    Err(e) => Err(e),
                }
            })
            .await;
        match res {
            Ok(()) => Ok(true),
            Err(RetryError::Exhausted(e)) => {
                warn!("Record {} did not propagate. {}", fqdn, e);
                Ok(false)
            }
            Err(RetryError::Cancelled) => Err(AcmeError::Shutdown),
        }
    }

    /// Whether `fqdn` is a CNAME pointing at `target`.
    pub async fn check_cname(&self, fqdn: &str, target: &str) -> Result<bool, AcmeError> {
        self.check_record(fqdn, target.trim_end_matches('.'), DnsRecordType::Cname).await
    }
}
