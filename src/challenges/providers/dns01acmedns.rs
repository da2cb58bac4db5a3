use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use super::ProviderContext;
use crate::{crypt::domain_valid, AcmeError, HttpClient, Method, CONTENT_TYPE_JSON, HEADER_CONTENT_TYPE};

const UPDATE_ENDPOINT: &str = "/update";
const DNS_PREFIX: &str = "_acme-challenge.";

#[derive(Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct AcmeDnsResource {
    pub real_domain: String,
    pub full_domain: String,
    pub username: String,
    pub password: String,
}

impl AcmeDnsResource {
    fn subdomain(&self) -> &str {
        self.full_domain.split('.').next().unwrap_or_default()
    }
}

impl std::fmt::Debug for AcmeDnsResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeDnsResource")
            .field("real_domain", &self.real_domain)
            .field("full_domain", &self.full_domain)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub acme_dns_address: String,
    #[serde(default)]
    pub resources: Vec<AcmeDnsResource>,
}

/// Updates records on an acme-dns server. Only names listed in `resources` can be served.
pub struct Dns01AcmeDns {
    http: HttpClient,
    address: String,
    resources: Vec<AcmeDnsResource>,
}

fn validate(cfg: &Config) -> Result<(), AcmeError> {
    let mut problems = Vec::new();
    if !cfg.acme_dns_address.starts_with("https://") {
        problems.push(format!("address {} must start with https://", cfg.acme_dns_address));
    }
    let invalid: Vec<&str> = cfg
        .resources
        .iter()
        .flat_map(|r| [r.real_domain.as_str(), r.full_domain.as_str()])
        .filter(|d| !domain_valid(d, false))
        .collect();
    if !invalid.is_empty() {
        problems.push(format!("domains ({}) are not valid", invalid.join(", ")));
    }
    if cfg.resources.iter().any(|r| r.username.is_empty() || r.password.is_empty()) {
        problems.push("username and password must be set on every resource".to_string());
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(AcmeError::Provider(format!("acme-dns config invalid: {}", problems.join(", "))))
    }
}

impl Dns01AcmeDns {
    pub fn new(cfg: &Config, ctx: &ProviderContext) -> Result<Self, AcmeError> {
        validate(cfg)?;
        Ok(Dns01AcmeDns {
            http: ctx.http.clone(),
            address: cfg.acme_dns_address.trim_end_matches('/').to_string(),
            resources: cfg.resources.clone(),
        })
    }

    fn resource(&self, name: &str) -> Result<&AcmeDnsResource, AcmeError> {
        self.resources
            .iter()
            .find(|r| name.strip_prefix(DNS_PREFIX) == Some(r.real_domain.as_str()))
            .ok_or_else(|| AcmeError::Provider(format!("acme-dns has no resource for {}", name)))
    }

    pub async fn provision(&self, name: &str, content: &str) -> Result<(), AcmeError> {
        let r = self.resource(name)?;
        let body = json!({"subdomain": r.subdomain(), "txt": content}).to_string();
        let headers: BTreeMap<&str, String> = [
            (HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON.to_string()),
            ("x-api-user", r.username.clone()),
            ("x-api-key", r.password.clone()),
        ]
        .into_iter()
        .collect();

        let url = format!("{}{}", self.address, UPDATE_ENDPOINT);
        let res = self.http.request(&url, Some(body), headers, Method::POST).await?;
        if res.status != 200 {
            return Err(AcmeError::Provider(format!("acme-dns update of {} failed with {}", r.full_domain, res.status)));
        }
        debug!("acme-dns updated {} for {}", r.full_domain, name);
        Ok(())
    }

    /// acme-dns keeps the last two values and has no delete, so this only confirms the name is known.
    pub fn deprovision(&self, name: &str) -> Result<(), AcmeError> {
        self.resource(name).map(|_| ())
    }
}
