use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, collections::HashMap, fmt, sync::Mutex};

use super::{zone_of, ProviderContext};
use crate::{
    crypt::{regx1, sha256},
    AcmeError, HttpClient, Method,
};

mod aliyun;
mod dnspod;

const TIP_SIGN_FAILED: &str = "请求API接口失败，可能签名失败，具体请参考日志";
const TIP_API_FAILED: &str = "请求API接口失败，具体请参考日志";

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenericApi {
    #[serde(alias = "ali")]
    Aliyun,
    #[serde(alias = "dp")]
    Dnspod,
}

#[derive(Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Config {
    pub api: GenericApi,
    pub secret_id: String,
    pub secret_key: String,
    /// overrides `https://<api host>`, the signature still names the real host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api", &self.api)
            .field("secret_id", &self.secret_id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

pub(crate) struct ApiAction {
    name: &'static str,
    version: &'static str,
    payload: String,
}

/// A cloud dns api signed with an HMAC-SHA256 "v3" scheme over a canonical request.
pub(crate) trait SignedDnsApi: Sync {
    fn host(&self) -> &'static str;
    fn content_type(&self) -> &'static str;
    fn alg(&self) -> &'static str;
    /// headers that take part in the signature; all of them when None
    fn signed_headers(&self) -> Option<&'static [&'static str]> {
        None
    }

    fn add_record(&self, zone: &str, rr: &str, value: &str) -> ApiAction;
    fn del_record(&self, zone: &str, record_id: &str) -> ApiAction;

    fn stamp(&self, action: &ApiAction, hashed_payload: &str, now: DateTime<Utc>, btm: &mut BTreeMap<&'static str, String>);
    fn sign(&self, s_key: &str, canonical: &str, btm: &BTreeMap<&'static str, String>) -> Result<String, AcmeError>;
    fn credential(&self, s_id: &str, _btm: &BTreeMap<&'static str, String>) -> Result<String, AcmeError> {
        Ok(s_id.to_string())
    }

    fn regx_record_id(&self) -> &'static str;

    fn parse_record_id(&self, res: &str) -> Result<String, AcmeError> {
        regx1(res, self.regx_record_id()).map_err(|_| AcmeError::Provider("解析DNS记录ID失败".to_string()))
    }
}

pub(crate) fn header<'a>(btm: &'a BTreeMap<&'static str, String>, k: &str) -> Result<&'a str, AcmeError> {
    btm.get(k).map(|s| s.as_str()).ok_or_else(|| AcmeError::Provider(format!("Missing header {}", k)))
}

// https://help.aliyun.com/zh/sdk/product-overview/v3-request-structure-and-signature
pub(crate) fn to_authorization(
    api: &dyn SignedDnsApi,
    action: &ApiAction,
    s_id: &str,
    s_key: &str,
    now: DateTime<Utc>,
) -> Result<BTreeMap<&'static str, String>, AcmeError> {
    let method = "POST";
    let uri = "/";
    let hashed_payload = sha256(&action.payload);

    let mut btm: BTreeMap<&'static str, String> = BTreeMap::new();
    btm.insert("content-type", api.content_type().to_string());
    btm.insert("host", api.host().to_string());
    api.stamp(action, &hashed_payload, now, &mut btm);

    let valid = api.signed_headers();
    let mut canonical_headers = String::new();
    let mut signed: Vec<&str> = Vec::new();
    for (k, v) in btm.iter() {
        if valid.is_some_and(|vh| !vh.contains(k)) {
            continue;
        }
        let v = if valid.is_some() { v.to_lowercase() } else { v.to_string() };
        canonical_headers.push_str(&format!("{}:{}\n", k, v));
        signed.push(k);
    }
    let signed_headers = signed.join(";");

    let canonical = [method, uri, "", &canonical_headers, &signed_headers, &hashed_payload].join("\n");
    let canonical = sha256(&canonical);
    let signature = api.sign(s_key, &canonical, &btm)?;

    let authorization = format!(
        "{} Credential={}, SignedHeaders={}, Signature={}",
        api.alg(),
        api.credential(s_id, &btm)?,
        signed_headers,
        signature
    );
    btm.insert("authorization", authorization);
    Ok(btm)
}

/// Aliyun / DNSPod record management. Record ids from provisioning are kept for deletion.
pub struct Dns01Generic {
    http: HttpClient,
    api: GenericApi,
    secret_id: String,
    secret_key: String,
    endpoint: String,
    records: Mutex<HashMap<(String, String), (String, String)>>,
}

impl Dns01Generic {
    pub fn new(cfg: &Config, ctx: &ProviderContext) -> Result<Self, AcmeError> {
        if cfg.secret_id.is_empty() || cfg.secret_key.is_empty() {
            return AcmeError::tip(&format!("The dns api: {:?}, [id or key] does not exist", cfg.api));
        }
        let api = Self::signer(cfg.api);
        Ok(Dns01Generic {
            http: ctx.http.clone(),
            api: cfg.api,
            secret_id: cfg.secret_id.clone(),
            secret_key: cfg.secret_key.clone(),
            endpoint: cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| format!("https://{}", api.host()))
                .trim_end_matches('/')
                .to_string(),
            records: Mutex::new(HashMap::new()),
        })
    }

    fn signer(api: GenericApi) -> &'static dyn SignedDnsApi {
        match api {
            GenericApi::Aliyun => &aliyun::AliYun,
            GenericApi::Dnspod => &dnspod::DnsPod,
        }
    }

    async fn call(&self, action: ApiAction) -> Result<String, AcmeError> {
        let api = Self::signer(self.api);
        let headers = to_authorization(api, &action, &self.secret_id, &self.secret_key, Utc::now())?;
        let res = self.http.request(&format!("{}/", self.endpoint), Some(action.payload), headers, Method::POST).await?;
        let body = res.text();
        if res.status == 400 || res.status == 401 {
            return Err(AcmeError::Provider(TIP_SIGN_FAILED.to_string()));
        } else if res.status != 200 || body.contains("Error") {
            return Err(AcmeError::Provider(TIP_API_FAILED.to_string()));
        }
        Ok(body)
    }

    pub async fn provision(&self, name: &str, content: &str) -> Result<(), AcmeError> {
        let zone = zone_of(name)?;
        let rr = name.strip_suffix(&format!(".{}", zone)).unwrap_or("@");
        let api = Self::signer(self.api);

        let res = self.call(api.add_record(&zone, rr, content)).await?;
        let id = api.parse_record_id(&res)?;
        debug!("{:?} record {} created with id {}", self.api, name, id);
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((name.to_string(), content.to_string()), (zone, id));
        Ok(())
    }

    pub async fn deprovision(&self, name: &str, content: &str) -> Result<(), AcmeError> {
        let record = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(name.to_string(), content.to_string()));
        let (zone, id) = match record {
            Some(r) => r,
            None => {
                warn!("{:?} has no record id for {}, nothing to delete", self.api, name);
                return Ok(());
            }
        };
        self.call(Self::signer(self.api).del_record(&zone, &id)).await?;
        debug!("{:?} record {} ({}) deleted", self.api, name, id);
        Ok(())
    }
}
