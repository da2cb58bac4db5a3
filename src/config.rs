use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path};

use crate::{
    acme::{Eab, KeyAlg, RefreshIntervals},
    challenges::ChallengesConfig,
    crypt::domain_valid,
    AcmeError,
};

const URL_LE: &str = "https://acme-v02.api.letsencrypt.org/directory";
const URL_LE_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
const URL_ZERO: &str = "https://acme.zerossl.com/v2/DV90";
const URL_GOOGLE: &str = "https://dv.acme-v02.api.pki.goog/directory"; //注意大陆境内，该链接无法访问

const ACCOUNT_KEY_FILE: &str = "account.key";

const TIP_MISSING_DNS: &str = "Missing parameter 'dns', like: dns=a.org,www.a.org";
const TIP_EAB_PAIR: &str = "Parameters 'eab_kid' and 'eab_key' must be given together";

/// Loaded from `cfg=<path>`; every field may be left out.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct FileCfg {
    pub challenges: ChallengesConfig,
    pub directory_refresh: RefreshIntervals,
}

impl FileCfg {
    pub fn load(path: &str) -> Result<Self, AcmeError> {
        let s = fs::read_to_string(path).map_err(|e| AcmeError::Tip(format!("Read config {} failed. {}", path, e)))?;
        Ok(serde_json::from_str(&s)?)
    }
}

#[derive(Debug)]
pub struct AcmeCfg {
    pub directory_url: String,
    pub dns: Vec<String>,
    pub email: Option<String>,
    pub eab: Option<Eab>,
    pub preferred_chain: Option<String>,
    /// algorithm of the certificate key, the account key keeps its own
    pub alg: KeyAlg,
    pub account_key_path: String,
    pub out_dir: String,
    pub log_level: LevelFilter,
    pub file: FileCfg,
}

impl AcmeCfg {
    // cargo run -- dns=ai8.rs,www.ai8.rs dir=le email=a@a.org out=/etc/nginx/ssl/ai8.rs cfg=acme.json
    pub fn new(args: &[String]) -> Result<Self, AcmeError> {
        let map: HashMap<&str, &str> = args.iter().filter_map(|a| a.split_once('=')).collect();
        let get = |k: &str| map.get(k).map(|v| v.trim()).filter(|v| !v.is_empty());

        let dns: Vec<String> = get("dns")
            .ok_or_else(|| AcmeError::Tip(TIP_MISSING_DNS.to_string()))?
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if dns.is_empty() {
            return AcmeError::tip(TIP_MISSING_DNS);
        }
        if let Some(bad) = dns.iter().find(|d| !domain_valid(d, true)) {
            return Err(AcmeError::Tip(format!("Invalid domain: {}", bad)));
        }

        let directory_url = directory_url(get("dir").unwrap_or("le"))?;

        let eab = match (get("eab_kid"), get("eab_key")) {
            (Some(kid), Some(key)) => Some(Eab::new(kid, key)),
            (None, None) => None,
            _ => return AcmeError::tip(TIP_EAB_PAIR),
        };

        let out_dir = get("out").unwrap_or(".").trim_end_matches('/').to_string();
        let out_dir = if out_dir.is_empty() { "/".to_string() } else { out_dir };
        let account_key_path = get("key")
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{}/{}", out_dir, ACCOUNT_KEY_FILE));

        let log_level = match get("log").map(|s| s.to_lowercase()).as_deref() {
            Some("trace") => LevelFilter::Trace,
            Some("debug") => LevelFilter::Debug,
            Some("warn") => LevelFilter::Warn,
            Some("error") => LevelFilter::Error,
            _ => LevelFilter::Info,
        };

        let file = match get("cfg") {
            Some(path) => FileCfg::load(path)?,
            None => FileCfg::default(),
        };

        Ok(AcmeCfg {
            directory_url,
            dns,
            email: get("email").map(|s| s.to_string()),
            eab,
            preferred_chain: get("preferred_chain").map(|s| s.to_string()),
            alg: KeyAlg::new(get("alg").unwrap_or_default()),
            account_key_path,
            out_dir,
            log_level,
            file,
        })
    }

    pub fn out_path(&self, name: &str) -> String {
        Path::new(&self.out_dir).join(name).to_string_lossy().to_string()
    }
}

// short names of well known CAs, otherwise an https url
fn directory_url(dir: &str) -> Result<String, AcmeError> {
    let url = match dir.to_lowercase().as_str() {
        "le" => URL_LE,
        "le_staging" | "staging" => URL_LE_STAGING,
        "z" | "zero" => URL_ZERO,
        "g" | "google" => URL_GOOGLE,
        _ if dir.starts_with("https://") => dir,
        _ => return Err(AcmeError::Tip(format!("The directory must be an https url: {}", dir))),
    };
    Ok(url.to_string())
}
