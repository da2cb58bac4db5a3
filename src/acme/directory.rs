use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{AcmeError, HttpClient};

const REFRESH_SUCCESS_SECS: u64 = 24 * 3600;
const REFRESH_FAILURE_SECS: u64 = 15 * 60;

// GET https://acme-v02.api.letsencrypt.org/directory
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    #[serde(default)]
    pub new_nonce: String,
    #[serde(default)]
    pub new_account: String,
    #[serde(default)]
    pub new_order: String,
    #[serde(default)]
    pub revoke_cert: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_change: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_authz: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_info: Option<String>,
    #[serde(default)]
    pub meta: DirectoryMeta,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default)]
    pub caa_identities: Vec<String>,
    #[serde(default)]
    pub external_account_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Directory {
    fn check(&self) -> Result<(), AcmeError> {
        let required = [
            ("newNonce", &self.new_nonce),
            ("newAccount", &self.new_account),
            ("newOrder", &self.new_order),
            ("revokeCert", &self.revoke_cert),
        ];
        match required.iter().find(|(_, v)| v.is_empty()) {
            Some((name, _)) => Err(AcmeError::Validation(format!("directory is missing {}", name))),
            None => Ok(()),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RefreshIntervals {
    pub success_secs: u64,
    pub failure_secs: u64,
}

impl Default for RefreshIntervals {
    fn default() -> Self {
        RefreshIntervals {
            success_secs: REFRESH_SUCCESS_SECS,
            failure_secs: REFRESH_FAILURE_SECS,
        }
    }
}

/// Holds the current directory snapshot of one acme server.
///
/// Readers clone the `Arc`; a refresh replaces it only when the content changed.
#[derive(Debug)]
pub struct DirectoryManager {
    http: HttpClient,
    url: String,
    current: RwLock<Arc<Directory>>,
}

impl DirectoryManager {
    /// Fetches once. An unreachable or malformed directory fails construction.
    pub async fn new(http: HttpClient, url: &str) -> Result<Self, AcmeError> {
        let manager = DirectoryManager {
            http,
            url: url.to_string(),
            current: RwLock::new(Arc::new(Directory::default())),
        };
        manager.fetch_directory().await?;
        Ok(manager)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn snapshot(&self) -> Arc<Directory> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns true when the stored directory was replaced.
    pub async fn fetch_directory(&self) -> Result<bool, AcmeError> {
        let res = self.http.get(&self.url).await?;
        if !res.is_success() {
            return Err(AcmeError::Status {
                url: self.url.clone(),
                code: res.status,
            });
        }
        let dir: Directory = serde_json::from_slice(&res.body)?;
        dir.check()?;

        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if **current == dir {
            debug!("Directory {} unchanged", self.url);
            return Ok(false);
        }
        info!("Directory {} updated", self.url);
        *current = Arc::new(dir);
        Ok(true)
    }

    /// Refreshes until `cancel` fires. Failures are logged and retried on the shorter interval.
    pub fn spawn_refresh(self: &Arc<Self>, intervals: RefreshIntervals, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut wait = Duration::from_secs(intervals.success_secs);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Directory refresh for {} stopped", manager.url);
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                wait = match manager.fetch_directory().await {
                    Ok(_) => Duration::from_secs(intervals.success_secs),
                    Err(e) => {
                        warn!("Refresh directory {} failed, retry in {}s. {}", manager.url, intervals.failure_secs, e);
                        Duration::from_secs(intervals.failure_secs)
                    }
                };
            }
        })
    }
}
