use futures::future::join_all;
use log::{debug, error, info};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};
use tokio::sync::Mutex;

use super::{Provider, ProviderConfig, ProviderContext, ProviderSpec};
use crate::{acme::Identifier, crypt::domain_valid, AcmeError};

const WILDCARD: &str = "*";

/// A running provider and the domains it answers for.
#[derive(Debug)]
pub struct ProviderRecord {
    pub id: usize,
    pub tag: String,
    pub domains: Vec<String>,
    pub config: ProviderConfig,
    pub provider: Arc<Provider>,
}

impl ProviderRecord {
    fn with_domains(&self, domains: Vec<String>) -> Self {
        ProviderRecord {
            id: self.id,
            tag: self.tag.clone(),
            domains,
            config: self.config.clone(),
            provider: self.provider.clone(),
        }
    }
}

// immutable snapshot, rebuilt on every mutation
#[derive(Default)]
struct RoutingIndex {
    exact: HashMap<String, usize>,
    wildcard: Option<usize>,
    records: BTreeMap<usize, Arc<ProviderRecord>>,
}

impl RoutingIndex {
    fn build(records: BTreeMap<usize, Arc<ProviderRecord>>) -> Self {
        let mut index = RoutingIndex::default();
        for r in records.values() {
            index.claim(r.id, &r.domains);
        }
        index.records = records;
        index
    }

    fn claim(&mut self, id: usize, domains: &[String]) {
        for d in domains {
            if d == WILDCARD {
                self.wildcard = Some(id);
            } else {
                self.exact.insert(d.clone(), id);
            }
        }
    }

    /// Fails when a domain already belongs to a provider other than `owner`.
    fn check(&self, owner: Option<usize>, domains: &[String]) -> Result<(), AcmeError> {
        for d in domains {
            let claimed = if d == WILDCARD { self.wildcard } else { self.exact.get(d).copied() };
            match claimed {
                Some(other) if Some(other) != owner => {
                    return Err(AcmeError::Provider(format!("domain {} is already served by provider {}", d, other)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn route(&self, domain: &str) -> Option<&Arc<ProviderRecord>> {
        let domain = domain.trim_start_matches("*.").trim_end_matches('.').to_lowercase();
        let id = match self.exact.get(&domain) {
            Some(id) => Some(*id),
            None => {
                // walk up one label at a time, the first hit is the longest suffix
                let mut rest = domain.as_str();
                let mut found = None;
                while let Some((_, parent)) = rest.split_once('.') {
                    if let Some(id) = self.exact.get(parent) {
                        found = Some(*id);
                        break;
                    }
                    rest = parent;
                }
                found.or(self.wildcard)
            }
        };
        id.and_then(|id| self.records.get(&id))
    }
}

fn normalize(domains: &[String]) -> Result<Vec<String>, AcmeError> {
    let mut out: Vec<String> = domains.iter().map(|d| d.trim().trim_end_matches('.').to_lowercase()).collect();
    out.sort();
    out.dedup();
    if out.is_empty() {
        return Err(AcmeError::Provider("a provider needs at least one domain".to_string()));
    }
    if out.iter().any(|d| d == WILDCARD) {
        if out.len() > 1 {
            return Err(AcmeError::Provider("the wildcard provider must not list other domains".to_string()));
        }
        return Ok(out);
    }
    let invalid: Vec<&str> = out.iter().filter(|d| !domain_valid(d, false)).map(|d| d.as_str()).collect();
    if !invalid.is_empty() {
        return Err(AcmeError::Provider(format!("invalid provider domains: {}", invalid.join(", "))));
    }
    Ok(out)
}

async fn bring_up(config: &ProviderConfig, ctx: &ProviderContext) -> Result<Provider, AcmeError> {
    let provider = Provider::new(config, ctx)?;
    provider.start().await?;
    Ok(provider)
}

/// Owns every configured provider and routes identifiers to them.
pub struct ProviderManager {
    ctx: ProviderContext,
    next_id: AtomicUsize,
    index: RwLock<Arc<RoutingIndex>>,
    // serializes add / delete / update
    mutation: Mutex<()>,
}

impl ProviderManager {
    /// Validates all specs, then constructs and starts the providers concurrently.
    /// If any of them fails, the ones already up are stopped again.
    pub async fn new(specs: &[ProviderSpec], ctx: ProviderContext) -> Result<Self, AcmeError> {
        if specs.is_empty() {
            return Err(AcmeError::Provider("no challenge providers configured".to_string()));
        }

        let mut draft = RoutingIndex::default();
        let mut domains = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let id = i + 1;
            let d = normalize(&spec.domains)?;
            draft.check(None, &d)?;
            draft.claim(id, &d);
            domains.push(d);
        }

        let results = join_all(specs.iter().map(|s| bring_up(&s.config, &ctx))).await;
        let mut started = Vec::with_capacity(results.len());
        let mut failure = None;
        for r in results {
            match r {
                Ok(p) => started.push(p),
                Err(e) => {
                    error!("challenge provider bring-up failed. {}", e);
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            join_all(started.iter().map(|p| p.stop())).await;
            return Err(e);
        }

        let records: BTreeMap<usize, Arc<ProviderRecord>> = specs
            .iter()
            .zip(domains)
            .zip(started)
            .enumerate()
            .map(|(i, ((spec, domains), provider))| {
                let id = i + 1;
                info!("challenge provider {} ({}) serves {:?}", id, provider.name(), domains);
                let record = ProviderRecord {
                    id,
                    tag: spec.tag.clone(),
                    domains,
                    config: spec.config.clone(),
                    provider: Arc::new(provider),
                };
                (id, Arc::new(record))
            })
            .collect();

        Ok(ProviderManager {
            ctx,
            next_id: AtomicUsize::new(specs.len() + 1),
            index: RwLock::new(Arc::new(RoutingIndex::build(records))),
            mutation: Mutex::new(()),
        })
    }

    fn snapshot(&self) -> Arc<RoutingIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn swap(&self, records: BTreeMap<usize, Arc<ProviderRecord>>) {
        *self.index.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(RoutingIndex::build(records));
    }

    pub fn routing(&self, identifier: &Identifier) -> Result<Arc<ProviderRecord>, AcmeError> {
        if !identifier.is_dns() {
            return Err(AcmeError::Provider(format!("unsupported identifier type {}", identifier.kind)));
        }
        self.provider_for(&identifier.value)
    }

    pub fn provider_for(&self, domain: &str) -> Result<Arc<ProviderRecord>, AcmeError> {
        let index = self.snapshot();
        let record = index
            .route(domain)
            .ok_or_else(|| AcmeError::Provider(format!("no provider for identifier {}", domain)))?;
        debug!("{} routed to provider {} ({})", domain, record.id, record.provider.name());
        Ok(record.clone())
    }

    pub fn providers(&self) -> Vec<Arc<ProviderRecord>> {
        self.snapshot().records.values().cloned().collect()
    }

    pub async fn add_provider(&self, spec: &ProviderSpec) -> Result<usize, AcmeError> {
        let _guard = self.mutation.lock().await;
        let domains = normalize(&spec.domains)?;
        self.snapshot().check(None, &domains)?;

        let provider = bring_up(&spec.config, &self.ctx).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!("challenge provider {} ({}) added for {:?}", id, provider.name(), domains);
        let record = ProviderRecord {
            id,
            tag: spec.tag.clone(),
            domains,
            config: spec.config.clone(),
            provider: Arc::new(provider),
        };

        let mut records = self.snapshot().records.clone();
        records.insert(id, Arc::new(record));
        self.swap(records);
        Ok(id)
    }

    /// Unindexes the provider first so nothing new is routed to it, then stops it.
    pub async fn delete_provider(&self, id: usize) -> Result<(), AcmeError> {
        let _guard = self.mutation.lock().await;
        let mut records = self.snapshot().records.clone();
        let record = records
            .remove(&id)
            .ok_or_else(|| AcmeError::Provider(format!("provider {} does not exist", id)))?;
        self.swap(records);
        info!("challenge provider {} ({}) deleted", id, record.provider.name());
        record.provider.stop().await
    }

    pub async fn update_provider_domains(&self, id: usize, domains: &[String]) -> Result<(), AcmeError> {
        let _guard = self.mutation.lock().await;
        let index = self.snapshot();
        let record = index
            .records
            .get(&id)
            .ok_or_else(|| AcmeError::Provider(format!("provider {} does not exist", id)))?;
        let domains = normalize(domains)?;
        index.check(Some(id), &domains)?;

        info!("challenge provider {} now serves {:?}", id, domains);
        let mut records = index.records.clone();
        records.insert(id, Arc::new(record.with_domains(domains)));
        self.swap(records);
        Ok(())
    }

    pub async fn start_all(&self) -> Result<(), AcmeError> {
        let records = self.providers();
        let results = join_all(records.iter().map(|r| r.provider.start())).await;
        results.into_iter().collect()
    }

    /// Stops every provider; the last failure is returned after all have been asked to stop.
    pub async fn stop_all(&self) -> Result<(), AcmeError> {
        let records = self.providers();
        let results = join_all(records.iter().map(|r| r.provider.stop())).await;
        let mut last = Ok(());
        for (r, res) in records.iter().zip(results) {
            if let Err(e) = res {
                error!("challenge provider {} ({}) did not stop. {}", r.id, r.provider.name(), e);
                last = Err(e);
            }
        }
        last
    }
}
