//! Challenge providers: the closed set of ways a validation resource gets published.

mod dns01acmedns;
mod dns01acmesh;
mod dns01cloudflare;
mod dns01generic;
mod dns01manual;
mod http01internal;
mod manager;

use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::acme::ChallengeType;
use crate::{AcmeError, HttpClient};

pub use dns01acmedns::{AcmeDnsResource, Config as AcmeDnsConfig, Dns01AcmeDns};
pub use dns01acmesh::{Config as AcmeShConfig, Dns01AcmeSh};
pub use dns01cloudflare::{CloudflareAccount, Config as CloudflareConfig, Dns01Cloudflare};
pub use dns01generic::{Config as GenericConfig, Dns01Generic, GenericApi};
pub use dns01manual::{Config as ManualConfig, Dns01Manual};
pub use http01internal::{Config as Http01InternalConfig, Http01Internal};
pub use manager::{ProviderManager, ProviderRecord};

/// What a provider needs from the rest of the process.
#[derive(Clone, Debug)]
pub struct ProviderContext {
    pub http: HttpClient,
    pub cancel: CancellationToken,
}

/// Provider settings, tagged by kind.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    Http01Internal(Http01InternalConfig),
    Dns01Manual(ManualConfig),
    Dns01AcmeSh(AcmeShConfig),
    Dns01AcmeDns(AcmeDnsConfig),
    Dns01Cloudflare(CloudflareConfig),
    Dns01Generic(GenericConfig),
}

impl ProviderConfig {
    pub fn challenge_type(&self) -> ChallengeType {
        match self {
            ProviderConfig::Http01Internal(_) => ChallengeType::Http01,
            _ => ChallengeType::Dns01,
        }
    }
}

/// One configured provider as it appears in the config file.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ProviderSpec {
    #[serde(default)]
    pub tag: String,
    pub domains: Vec<String>,
    pub config: ProviderConfig,
}

pub enum Provider {
    Http01Internal(Http01Internal),
    Dns01Manual(Dns01Manual),
    Dns01AcmeSh(Dns01AcmeSh),
    Dns01AcmeDns(Dns01AcmeDns),
    Dns01Cloudflare(Dns01Cloudflare),
    Dns01Generic(Dns01Generic),
}

impl Provider {
    /// Builds the provider without starting it.
    pub fn new(config: &ProviderConfig, ctx: &ProviderContext) -> Result<Self, AcmeError> {
        Ok(match config {
            ProviderConfig::Http01Internal(c) => Provider::Http01Internal(Http01Internal::new(c, ctx)),
            ProviderConfig::Dns01Manual(c) => Provider::Dns01Manual(Dns01Manual::new(c)?),
            ProviderConfig::Dns01AcmeSh(c) => Provider::Dns01AcmeSh(Dns01AcmeSh::new(c)?),
            ProviderConfig::Dns01AcmeDns(c) => Provider::Dns01AcmeDns(Dns01AcmeDns::new(c, ctx)?),
            ProviderConfig::Dns01Cloudflare(c) => Provider::Dns01Cloudflare(Dns01Cloudflare::new(c, ctx)?),
            ProviderConfig::Dns01Generic(c) => Provider::Dns01Generic(Dns01Generic::new(c, ctx)?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Http01Internal(_) => "http01_internal",
            Provider::Dns01Manual(_) => "dns01_manual",
            Provider::Dns01AcmeSh(_) => "dns01_acme_sh",
            Provider::Dns01AcmeDns(_) => "dns01_acme_dns",
            Provider::Dns01Cloudflare(_) => "dns01_cloudflare",
            Provider::Dns01Generic(_) => "dns01_generic",
        }
    }

    pub fn challenge_type(&self) -> ChallengeType {
        match self {
            Provider::Http01Internal(_) => ChallengeType::Http01,
            _ => ChallengeType::Dns01,
        }
    }

    /// `name`/`content` are the validation resource: token and key authorization for http-01,
    /// record name and digest for dns-01.
    pub async fn provision(&self, name: &str, content: &str) -> Result<(), AcmeError> {
        match self {
            Provider::Http01Internal(p) => p.provision(name, content),
            Provider::Dns01Manual(p) => p.provision(name, content).await,
            Provider::Dns01AcmeSh(p) => p.provision(name, content).await,
            Provider::Dns01AcmeDns(p) => p.provision(name, content).await,
            Provider::Dns01Cloudflare(p) => p.provision(name, content).await,
            Provider::Dns01Generic(p) => p.provision(name, content).await,
        }
    }

    pub async fn deprovision(&self, name: &str, content: &str) -> Result<(), AcmeError> {
        match self {
            Provider::Http01Internal(p) => p.deprovision(name, content),
            Provider::Dns01Manual(p) => p.deprovision(name, content).await,
            Provider::Dns01AcmeSh(p) => p.deprovision(name, content).await,
            Provider::Dns01AcmeDns(p) => p.deprovision(name),
            Provider::Dns01Cloudflare(p) => p.deprovision(name, content).await,
            Provider::Dns01Generic(p) => p.deprovision(name, content).await,
        }
    }

    pub async fn start(&self) -> Result<(), AcmeError> {
        match self {
            Provider::Http01Internal(p) => p.start().await,
            Provider::Dns01Cloudflare(p) => p.start().await,
            _ => Ok(()),
        }
    }

    pub async fn stop(&self) -> Result<(), AcmeError> {
        match self {
            Provider::Http01Internal(p) => p.stop().await,
            Provider::Dns01Cloudflare(p) => {
                p.stop();
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Provider({})", self.name())
    }
}

/// Extra environment for script providers. Values never show up in logs.
#[derive(Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Environment(pub BTreeMap<String, String>);

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.0.keys().map(|k| (k, "[redacted]"))).finish()
    }
}

// runs to completion; a non-zero exit is a provider error carrying stderr
pub(crate) async fn run_script(label: &str, mut cmd: Command) -> Result<(), AcmeError> {
    let out = cmd
        .output()
        .await
        .map_err(|e| AcmeError::Provider(format!("{} script failed to run. {}", label, e)))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        error!("{} script exited with {}. stderr: {}", label, out.status, stderr.trim());
        return Err(AcmeError::Provider(format!("{} script exited with {}", label, out.status)));
    }
    debug!("{} script output: {}", label, String::from_utf8_lossy(&out.stdout).trim());
    Ok(())
}

// the first two labels from the right, e.g. _acme-challenge.www.a.com -> a.com
pub(crate) fn zone_of(name: &str) -> Result<String, AcmeError> {
    crate::crypt::root_domain(name).ok_or_else(|| AcmeError::Provider(format!("No zone in record name {}", name)))
}
