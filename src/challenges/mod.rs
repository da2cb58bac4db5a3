//! Solves one authorization: routes the identifier to a provider, publishes the validation
//! resource, waits for it to be visible and has the acme server validate it.

pub mod alias;
pub mod dns_checker;
pub mod providers;

use log::{debug, error, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{sleep, sleep_until, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::acme::{AccountKey, AcmeClient, Challenge, ChallengeStatus, ChallengeType, Identifier};
use crate::backoff::{Backoff, RetryError};
use crate::fulfillment::{Claimed, WorkClaim, WorkTracker};
use crate::{AcmeError, HttpClient};
use alias::AliasTable;
use dns_checker::{DnsChecker, DnsCheckerConfig};
use providers::{Provider, ProviderContext, ProviderManager, ProviderSpec};

const DNS_CHALLENGE_PREFIX: &str = "_acme-challenge.";
const DEFAULT_POST_PROVISION_WAIT_SECS: u64 = 180;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ChallengesConfig {
    pub dns_checker: DnsCheckerConfig,
    pub providers: Vec<ProviderSpec>,
    /// identifier domain -> domain the resource is published on instead
    pub aliases: HashMap<String, String>,
    /// minimum time between provisioning and asking the server to validate
    pub post_provision_wait_secs: u64,
}

impl Default for ChallengesConfig {
    fn default() -> Self {
        ChallengesConfig {
            dns_checker: DnsCheckerConfig::default(),
            providers: Vec::new(),
            aliases: HashMap::new(),
            post_provision_wait_secs: DEFAULT_POST_PROVISION_WAIT_SECS,
        }
    }
}

// provider api calls are serialized, and the slot is held a little longer than the call
#[derive(Debug, Clone)]
struct Pacing {
    post_provision_wait: Duration,
    first_check_delay: Duration,
    challenge_poll: Backoff,
    provision_hold: Duration,
    provision_hold_jitter: Duration,
    deprovision_hold: Duration,
}

impl Pacing {
    fn new(post_provision_wait: Duration) -> Self {
        Pacing {
            post_provision_wait,
            first_check_delay: Duration::from_secs(7),
            challenge_poll: Backoff::acme(),
            provision_hold: Duration::from_secs(2),
            provision_hold_jitter: Duration::from_secs(4),
            deprovision_hold: Duration::from_secs(1),
        }
    }

    fn provision_hold(&self) -> Duration {
        let jitter = self.provision_hold_jitter.as_millis() as u64;
        if jitter == 0 {
            return self.provision_hold;
        }
        self.provision_hold + Duration::from_millis(rand::thread_rng().gen_range(0..jitter))
    }
}

pub struct Challenges {
    aliases: AliasTable,
    providers: ProviderManager,
    dns_checker: DnsChecker,
    api_slot: Arc<Semaphore>,
    resources: Arc<WorkTracker>,
    deprovisions: TaskTracker,
    pacing: Pacing,
    cancel: CancellationToken,
}

impl Challenges {
    pub async fn new(cfg: &ChallengesConfig, http: HttpClient, cancel: CancellationToken) -> Result<Self, AcmeError> {
        let aliases = AliasTable::new(&cfg.aliases)?;
        let ctx = ProviderContext {
            http,
            cancel: cancel.clone(),
        };
        let providers = ProviderManager::new(&cfg.providers, ctx).await?;
        Ok(Challenges {
            aliases,
            providers,
            dns_checker: DnsChecker::new(&cfg.dns_checker, cancel.clone()),
            api_slot: Arc::new(Semaphore::new(1)),
            resources: Arc::new(WorkTracker::new()),
            deprovisions: TaskTracker::new(),
            pacing: Pacing::new(Duration::from_secs(cfg.post_provision_wait_secs)),
            cancel,
        })
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn providers(&self) -> &ProviderManager {
        &self.providers
    }

    /// Publishes the resource for `identifier` through its provider and drives the matching
    /// challenge to `valid` or `invalid`. An `invalid` challenge is not an error here, the
    /// authorization status tells the caller.
    pub async fn solve(
        &self,
        identifier: &Identifier,
        challenges: &[Challenge],
        key: &AccountKey,
        client: &AcmeClient,
    ) -> Result<(), AcmeError> {
        if !identifier.is_dns() {
            return Err(AcmeError::Validation(format!(
                "acme identifier is type ({}); only 'dns' is supported",
                identifier.kind
            )));
        }

        let domain = self.aliases.resolve(&identifier.value);
        if domain != identifier.value {
            debug!("alias exists for {}, will provision to {}", identifier.value, domain);
        }

        let record = self.providers.provider_for(&domain)?;
        let kind = record.provider.challenge_type();
        let challenge = challenges.iter().find(|c| c.kind == kind).ok_or_else(|| {
            AcmeError::Validation(format!(
                "provider's challenge type {} not found in challenges (possibly a wildcard with http-01)",
                kind
            ))
        })?;

        if domain != identifier.value {
            self.check_alias(&identifier.value, &domain, &kind).await?;
        }

        let (name, content) = challenge.validation_resource(&Identifier::dns(domain.as_str()), key)?;
        let claim = self.claim_resource(&name).await?;

        // cleans up and releases the resource when solve ends, returned or dropped
        let _cleanup = Deprovision {
            provider: record.provider.clone(),
            name: name.clone(),
            content: content.clone(),
            api_slot: self.api_slot.clone(),
            claim: Some(claim),
            hold: self.pacing.deprovision_hold,
            cancel: self.cancel.clone(),
            tasks: self.deprovisions.clone(),
        };
        self.provision(&record.provider, &name, &content).await?;
        let provisioned_at = Instant::now();

        if kind == ChallengeType::Dns01 && !self.dns_checker.check_txt_with_retry(&name, &content).await? {
            return Err(AcmeError::Propagation(format!("dns record {} didn't propagate", name)));
        }

        let wait_until = provisioned_at + self.pacing.post_provision_wait;
        if Instant::now() < wait_until {
            debug!(
                "minimum provisioning delay not met, waiting {}s to validate {}",
                (wait_until - Instant::now()).as_secs(),
                identifier.value
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(AcmeError::Shutdown),
                _ = sleep_until(wait_until) => {}
            }
        }

        let challenge = client.validate_challenge(&challenge.url, key).await?;
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(AcmeError::Shutdown),
            _ = sleep(self.pacing.first_check_delay) => {}
        }

        let url = challenge.url.as_str();
        let polled = self
            .pacing
            .challenge_poll
            .retry(&self.cancel, url, move || async move {
                let c = client.get_challenge(url, key).await?;
                match c.status {
                    ChallengeStatus::Valid | ChallengeStatus::Invalid => Ok(c),
                    s => Err(AcmeError::Validation(format!("challenge {} status ({:?}) not a final status", url, s))),
                }
            })
            .await;
        match polled {
            Ok(c) if c.status == ChallengeStatus::Invalid => {
                info!("challenge {} status invalid; acme error: {:?}", c.url, c.error);
                Ok(())
            }
            Ok(c) => {
                info!("challenge {} for {} is valid", c.url, identifier.value);
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(AcmeError::Shutdown),
            Err(RetryError::Exhausted(e)) => Err(AcmeError::Validation(format!(
                "challenge failed to move to final state (timeout). {}",
                e
            ))),
        }
    }

    async fn check_alias(&self, value: &str, domain: &str, kind: &ChallengeType) -> Result<(), AcmeError> {
        let (from, to) = match kind {
            ChallengeType::Dns01 => (
                format!("{}{}", DNS_CHALLENGE_PREFIX, value.trim_start_matches("*.")),
                format!("{}{}", DNS_CHALLENGE_PREFIX, domain.trim_start_matches("*.")),
            ),
            ChallengeType::Http01 => (value.to_string(), domain.to_string()),
            ChallengeType::Other(t) => {
                return Err(AcmeError::Validation(format!(
                    "challenge type {} doesn't support a domain alias (domain: {})",
                    t, domain
                )));
            }
        };
        if !self.dns_checker.check_cname(&from, &to).await? {
            return Err(AcmeError::Validation(format!("cname record {} doesn't exist or doesn't point to {}", from, to)));
        }
        debug!("cname record {} found and points to {}", from, to);
        Ok(())
    }

    // one solve per resource name at a time; later ones wait for the earlier deprovision
    async fn claim_resource(&self, name: &str) -> Result<WorkClaim, AcmeError> {
        loop {
            let signal = match self.resources.claim(name) {
                Claimed::Owner(claim) => return Ok(claim),
                Claimed::Busy(signal) => signal,
            };
            debug!("resource {} is in use, waiting", name);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(AcmeError::Shutdown),
                _ = signal.wait() => {}
            }
        }
    }

    async fn provision(&self, provider: &Provider, name: &str, content: &str) -> Result<(), AcmeError> {
        let slot = tokio::select! {
            _ = self.cancel.cancelled() => {
                error!("provision of {} aborted due to shutdown", name);
                return Err(AcmeError::Shutdown);
            }
            slot = self.api_slot.clone().acquire_owned() => slot.map_err(|_| AcmeError::Shutdown)?,
        };
        let res = provider.provision(name, content).await;
        release_after(slot, self.pacing.provision_hold());
        match &res {
            Ok(()) => debug!("{} provisioned {}", provider.name(), name),
            Err(e) => error!("{} failed to provision {}. {}", provider.name(), name, e),
        }
        res
    }

    /// Waits for every pending deprovision.
    pub async fn wait_deprovisions(&self) {
        self.deprovisions.close();
        self.deprovisions.wait().await;
        self.deprovisions.reopen();
    }

    /// Lets outstanding deprovisions finish, then stops all providers.
    pub async fn shutdown(&self) -> Result<(), AcmeError> {
        self.wait_deprovisions().await;
        self.providers.stop_all().await
    }

    #[cfg(test)]
    pub(crate) fn without_delays(mut self) -> Self {
        self.pacing = Pacing {
            post_provision_wait: Duration::ZERO,
            first_check_delay: Duration::ZERO,
            challenge_poll: Backoff {
                initial: Duration::from_millis(20),
                multiplier: 1.0,
                randomization: 0.0,
                max_interval: Duration::from_millis(20),
                max_elapsed: Duration::from_secs(2),
            },
            provision_hold: Duration::ZERO,
            provision_hold_jitter: Duration::ZERO,
            deprovision_hold: Duration::ZERO,
        };
        self
    }

    #[cfg(test)]
    pub(crate) fn with_post_provision_wait(mut self, wait: Duration) -> Self {
        self.pacing.post_provision_wait = wait;
        self
    }
}

fn release_after(slot: OwnedSemaphorePermit, hold: Duration) {
    tokio::spawn(async move {
        sleep(hold).await;
        drop(slot);
    });
}

struct Deprovision {
    provider: Arc<Provider>,
    name: String,
    content: String,
    api_slot: Arc<Semaphore>,
    claim: Option<WorkClaim>,
    hold: Duration,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Drop for Deprovision {
    fn drop(&mut self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(e) => {
                error!("cannot deprovision {}, no runtime. {}", self.name, e);
                return;
            }
        };
        let provider = self.provider.clone();
        let (name, content) = (std::mem::take(&mut self.name), std::mem::take(&mut self.content));
        let claim = self.claim.take();
        let (api_slot, cancel, hold) = (self.api_slot.clone(), self.cancel.clone(), self.hold);

        self.tasks.spawn_on(
            async move {
                // on shutdown go ahead without a slot, records must still be removed
                let slot = tokio::select! {
                    _ = cancel.cancelled() => None,
                    slot = api_slot.acquire_owned() => slot.ok(),
                };
                match provider.deprovision(&name, &content).await {
                    Ok(()) => debug!("{} deprovisioned {}", provider.name(), name),
                    Err(e) => error!("{} deprovision of {} failed. {}", provider.name(), name, e),
                }
                if let Some(slot) = slot {
                    release_after(slot, hold);
                }
                drop(claim);
            },
            &handle,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::mock::{MockAcme, MockResponse};
    use crate::acme::KeyAlg;
    use providers::{Http01InternalConfig, ProviderConfig};
    use serde_json::json;

    fn http01_cfg(domains: &[&str]) -> ChallengesConfig {
        ChallengesConfig {
            dns_checker: DnsCheckerConfig {
                skip_check_wait_seconds: Some(0),
                dns_services: Vec::new(),
            },
            providers: vec![ProviderSpec {
                tag: "web".to_string(),
                domains: domains.iter().map(|d| d.to_string()).collect(),
                config: ProviderConfig::Http01Internal(Http01InternalConfig {
                    port: 0,
                    bind: Some("127.0.0.1".to_string()),
                }),
            }],
            aliases: HashMap::new(),
            post_provision_wait_secs: 0,
        }
    }

    fn offered(mock: &MockAcme) -> Vec<Challenge> {
        serde_json::from_value(json!([
            {"type": "dns-01", "url": mock.url("/chall/dns"), "status": "pending", "token": "tok-dns"},
            {"type": "http-01", "url": mock.url("/chall/http"), "status": "pending", "token": "tok-http"},
        ]))
        .unwrap()
    }

    async fn setup(cfg: &ChallengesConfig) -> (MockAcme, AcmeClient, AccountKey, Challenges) {
        let mock = MockAcme::start().await;
        let client = AcmeClient::new(&mock.directory_url()).await.unwrap();
        let key = AccountKey::generate(KeyAlg::ECC256).unwrap().with_kid(mock.url("/acct/1"));
        let challenges = Challenges::new(cfg, HttpClient::new().unwrap(), CancellationToken::new())
            .await
            .unwrap()
            .without_delays();
        (mock, client, key, challenges)
    }

    #[tokio::test]
    async fn solves_http01_and_cleans_up() {
        let (mock, client, key, challenges) = setup(&http01_cfg(&["a.com"])).await;
        let polls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let url = mock.url("/chall/http");
        {
            let polls = polls.clone();
            mock.on("/chall/http", move |req| {
                // post-as-get has an empty payload, the validate call sends {}
                let status = if req.raw_payload.is_empty() && polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) > 0 {
                    "valid"
                } else {
                    "processing"
                };
                MockResponse::json(200, json!({"type": "http-01", "url": url, "status": status, "token": "tok-http"}))
            });
        }

        challenges.solve(&Identifier::dns("www.a.com"), &offered(&mock), &key, &client).await.unwrap();

        let requests = mock.requests("/chall/http");
        assert_eq!(requests[0].payload, json!({}));
        assert!(requests.len() >= 3);
        assert!(mock.requests("/chall/dns").is_empty());

        challenges.wait_deprovisions().await;
        assert!(challenges.resources.is_empty());

        let record = challenges.providers().provider_for("www.a.com").unwrap();
        let addr = match record.provider.as_ref() {
            Provider::Http01Internal(p) => p.local_addr().unwrap(),
            other => panic!("unexpected provider {:?}", other),
        };
        let res = reqwest::get(format!("http://{}/.well-known/acme-challenge/tok-http", addr)).await.unwrap();
        assert_eq!(res.status(), 404);
        challenges.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_solve_still_cleans_up() {
        let (mock, client, key, challenges) = setup(&http01_cfg(&["a.com"])).await;
        let challenges = challenges.with_post_provision_wait(Duration::from_secs(600));

        let identifier = Identifier::dns("www.a.com");
        let offered_challenges = offered(&mock);
        let solving = challenges.solve(&identifier, &offered_challenges, &key, &client);
        assert!(tokio::time::timeout(Duration::from_millis(500), solving).await.is_err());

        challenges.wait_deprovisions().await;
        assert!(challenges.resources.is_empty());
        // the resource can be claimed again right away
        let claim = tokio::time::timeout(Duration::from_secs(1), challenges.claim_resource("tok-http"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.key(), "tok-http");
        drop(claim);
        assert!(mock.requests("/chall/http").is_empty());
        challenges.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_challenge_is_not_an_error() {
        let (mock, client, key, challenges) = setup(&http01_cfg(&["a.com"])).await;
        let url = mock.url("/chall/http");
        mock.on("/chall/http", move |_| {
            MockResponse::json(
                200,
                json!({"type": "http-01", "url": url, "status": "invalid", "token": "tok-http",
                       "error": {"type": "urn:ietf:params:acme:error:unauthorized", "detail": "404"}}),
            )
        });
        challenges.solve(&Identifier::dns("a.com"), &offered(&mock), &key, &client).await.unwrap();
        challenges.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn refuses_what_it_cannot_solve() {
        let (mock, client, key, challenges) = setup(&http01_cfg(&["a.com"])).await;
        let only_dns: Vec<Challenge> = offered(&mock).into_iter().filter(|c| c.kind == ChallengeType::Dns01).collect();

        let err = challenges.solve(&Identifier::dns("a.com"), &only_dns, &key, &client).await.unwrap_err();
        assert!(err.to_string().contains("not found"), "{}", err);

        let ip = Identifier {
            kind: "ip".to_string(),
            value: "10.0.0.1".to_string(),
        };
        assert!(challenges.solve(&ip, &offered(&mock), &key, &client).await.is_err());
        assert!(challenges.solve(&Identifier::dns("b.com"), &offered(&mock), &key, &client).await.is_err());

        // nothing was provisioned, nothing to validate
        assert!(mock.requests("/chall/http").is_empty());
        challenges.shutdown().await.unwrap();
    }

    #[test]
    fn config_defaults() {
        let cfg: ChallengesConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.post_provision_wait_secs, 180);
        assert!(cfg.providers.is_empty() && cfg.aliases.is_empty());
    }
}
