use log::{debug, error, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::BTreeMap, fmt, sync::RwLock};

use super::ProviderContext;
use crate::{AcmeError, HttpClient, HttpResponse, Method, CONTENT_TYPE_JSON, HEADER_CONTENT_TYPE};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const PERMISSION_DNS_EDIT: &str = "#dns_records:edit";
const CODE_RECORD_EXISTS: i64 = 81057;
const RECORD_TTL: u32 = 60;
const PAGE_SIZE: u32 = 50;

#[derive(Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct CloudflareAccount {
    pub email: String,
    pub global_api_key: String,
}

#[derive(Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<CloudflareAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("account", &self.account.as_ref().map(|a| a.email.as_str()))
            .field("api_token", &self.api_token.as_ref().map(|_| "[redacted]"))
            .field("api_base", &self.api_base)
            .finish()
    }
}

enum Auth {
    Token(String),
    Account { email: String, key: String },
}

#[derive(Deserialize, Debug, Clone)]
struct Zone {
    id: String,
    name: String,
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct Record {
    id: String,
}

#[derive(Deserialize, Debug)]
struct CfError {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Debug)]
struct ResultInfo {
    #[serde(default)]
    total_pages: u32,
}

#[derive(Deserialize, Debug)]
struct CfResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<CfError>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

impl<T> CfResponse<T> {
    fn describe_errors(&self) -> String {
        self.errors.iter().map(|e| format!("{}: {}", e.code, e.message)).collect::<Vec<_>>().join("; ")
    }
}

/// Cloudflare v4 api. Zones the credentials may edit are listed on start.
pub struct Dns01Cloudflare {
    http: HttpClient,
    base: String,
    auth: Auth,
    zones: RwLock<Vec<Zone>>,
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_ref().filter(|s| !s.is_empty()).cloned()
}

impl Dns01Cloudflare {
    pub fn new(cfg: &Config, ctx: &ProviderContext) -> Result<Self, AcmeError> {
        let account = cfg.account.as_ref().filter(|a| !a.email.is_empty() && !a.global_api_key.is_empty());
        let auth = match (account, non_empty(&cfg.api_token)) {
            (Some(_), Some(_)) => {
                return Err(AcmeError::Provider(
                    "cloudflare takes either an account or an api token, not both".to_string(),
                ))
            }
            (Some(a), None) => Auth::Account {
                email: a.email.clone(),
                key: a.global_api_key.clone(),
            },
            (None, Some(t)) => Auth::Token(t),
            (None, None) => {
                return Err(AcmeError::Provider(
                    "cloudflare needs an account (email and global key) or an api token".to_string(),
                ))
            }
        };
        Ok(Dns01Cloudflare {
            http: ctx.http.clone(),
            base: non_empty(&cfg.api_base).unwrap_or_else(|| API_BASE.to_string()).trim_end_matches('/').to_string(),
            auth,
            zones: RwLock::new(Vec::new()),
        })
    }

    fn headers(&self) -> BTreeMap<&'static str, String> {
        let mut btm = BTreeMap::new();
        btm.insert(HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON.to_string());
        match &self.auth {
            Auth::Token(t) => {
                btm.insert("authorization", format!("Bearer {}", t));
            }
            Auth::Account { email, key } => {
                btm.insert("x-auth-email", email.clone());
                btm.insert("x-auth-key", key.clone());
            }
        }
        btm
    }

    async fn call<T: DeserializeOwned>(&self, method: Method, url: &str, body: Option<String>) -> Result<CfResponse<T>, AcmeError> {
        let res: HttpResponse = self.http.request(url, body, self.headers(), method).await?;
        serde_json::from_slice(&res.body)
            .map_err(|e| AcmeError::Provider(format!("cloudflare returned {} with an unreadable body. {}", res.status, e)))
    }

    async fn list_zones(&self) -> Result<Vec<Zone>, AcmeError> {
        let mut zones = Vec::new();
        let mut page = 1;
        loop {
            let url = format!("{}/zones?per_page={}&page={}", self.base, PAGE_SIZE, page);
            let res: CfResponse<Vec<Zone>> = self.call(Method::GET, &url, None).await?;
            if !res.success {
                return Err(AcmeError::Provider(format!("cloudflare list zones failed: {}", res.describe_errors())));
            }
            zones.extend(res.result.unwrap_or_default());
            let total = res.result_info.map(|i| i.total_pages).unwrap_or(1);
            if page >= total {
                break;
            }
            page += 1;
        }
        Ok(zones)
    }

    pub async fn start(&self) -> Result<(), AcmeError> {
        let zones: Vec<Zone> = self
            .list_zones()
            .await?
            .into_iter()
            .filter(|z| z.permissions.iter().any(|p| p == PERMISSION_DNS_EDIT))
            .collect();
        if zones.is_empty() {
            warn!("cloudflare credentials cannot edit dns on any zone");
        }
        info!("cloudflare zones: {:?}", zones.iter().map(|z| z.name.as_str()).collect::<Vec<_>>());
        *self.zones.write().unwrap_or_else(|e| e.into_inner()) = zones;
        Ok(())
    }

    pub fn stop(&self) {
        self.zones.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    // most specific zone on a label boundary
    fn zone_for(&self, name: &str) -> Result<String, AcmeError> {
        let zones = self.zones.read().unwrap_or_else(|e| e.into_inner());
        zones
            .iter()
            .filter(|z| name == z.name || name.ends_with(&format!(".{}", z.name)))
            .max_by_key(|z| z.name.len())
            .map(|z| z.id.clone())
            .ok_or_else(|| AcmeError::Provider(format!("cloudflare has no editable zone for {}", name)))
    }

    pub async fn provision(&self, name: &str, content: &str) -> Result<(), AcmeError> {
        let zone = self.zone_for(name)?;
        let url = format!("{}/zones/{}/dns_records", self.base, zone);
        let body = json!({"type": "TXT", "name": name, "content": content, "ttl": RECORD_TTL}).to_string();
        let res: CfResponse<Value> = self.call(Method::POST, &url, Some(body)).await?;
        if !res.success {
            if res.errors.iter().any(|e| e.code == CODE_RECORD_EXISTS) {
                debug!("cloudflare record {} already exists", name);
                return Ok(());
            }
            return Err(AcmeError::Provider(format!("cloudflare create {} failed: {}", name, res.describe_errors())));
        }
        debug!("cloudflare record {} created", name);
        Ok(())
    }

    pub async fn deprovision(&self, name: &str, content: &str) -> Result<(), AcmeError> {
        let zone = self.zone_for(name)?;
        let records_url = format!("{}/zones/{}/dns_records", self.base, zone);
        let url = reqwest::Url::parse_with_params(&records_url, &[("type", "TXT"), ("name", name), ("content", content)])
            .map_err(|e| AcmeError::Provider(format!("Bad cloudflare url {}. {}", records_url, e)))?;
        let res: CfResponse<Vec<Record>> = self.call(Method::GET, url.as_str(), None).await?;
        if !res.success {
            return Err(AcmeError::Provider(format!("cloudflare list {} failed: {}", name, res.describe_errors())));
        }

        let mut last_err = None;
        for record in res.result.unwrap_or_default() {
            let url = format!("{}/{}", records_url, record.id);
            match self.call::<Value>(Method::DELETE, &url, None).await {
                Ok(r) if r.success => debug!("cloudflare record {} ({}) deleted", name, record.id),
                Ok(r) => {
                    let e = AcmeError::Provider(format!("cloudflare delete {} failed: {}", record.id, r.describe_errors()));
                    error!("{}", e);
                    last_err = Some(e);
                }
                Err(e) => {
                    error!("cloudflare delete {} failed. {}", record.id, e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query, State},
        http::HeaderMap,
        routing::{delete, get},
        Json, Router,
    };
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct FakeCloudflare {
        // (id, zone, name, content)
        records: Mutex<Vec<(String, String, String, String)>>,
        auth: Mutex<Vec<String>>,
    }

    type Fake = Arc<FakeCloudflare>;

    async fn zones(State(fake): State<Fake>, headers: HeaderMap) -> Json<Value> {
        let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or_default();
        fake.auth.lock().unwrap().push(auth.to_string());
        Json(json!({
            "success": true,
            "errors": [],
            "result": [
                {"id": "z1", "name": "a.com", "permissions": ["#zone:read", "#dns_records:edit"]},
                {"id": "z2", "name": "sub.a.com", "permissions": ["#dns_records:edit"]},
                {"id": "z3", "name": "ro.com", "permissions": ["#zone:read"]}
            ],
            "result_info": {"page": 1, "total_pages": 1}
        }))
    }

    async fn create(State(fake): State<Fake>, Path(zone): Path<String>, Json(body): Json<Value>) -> Json<Value> {
        let name = body["name"].as_str().unwrap_or_default().to_string();
        let content = body["content"].as_str().unwrap_or_default().to_string();
        let mut records = fake.records.lock().unwrap();
        if records.iter().any(|r| r.2 == name && r.3 == content) {
            return Json(json!({"success": false, "errors": [{"code": 81057, "message": "Record already exists."}]}));
        }
        assert_eq!(body["ttl"], 60);
        let id = format!("r{}", records.len() + 1);
        records.push((id.clone(), zone, name, content));
        Json(json!({"success": true, "errors": [], "result": {"id": id}}))
    }

    async fn list(State(fake): State<Fake>, Path(zone): Path<String>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        let records = fake.records.lock().unwrap();
        let found: Vec<Value> = records
            .iter()
            .filter(|r| r.1 == zone && Some(&r.2) == q.get("name") && Some(&r.3) == q.get("content"))
            .map(|r| json!({"id": r.0}))
            .collect();
        Json(json!({"success": true, "errors": [], "result": found}))
    }

    async fn remove(State(fake): State<Fake>, Path((_zone, id)): Path<(String, String)>) -> Json<Value> {
        fake.records.lock().unwrap().retain(|r| r.0 != id);
        Json(json!({"success": true, "errors": [], "result": {"id": id}}))
    }

    async fn serve() -> (String, Fake) {
        let fake = Fake::default();
        let app = Router::new()
            .route("/zones", get(zones))
            .route("/zones/{zone}/dns_records", get(list).post(create))
            .route("/zones/{zone}/dns_records/{id}", delete(remove))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (format!("http://{}", addr), fake)
    }

    fn ctx() -> ProviderContext {
        ProviderContext {
            http: HttpClient::new().unwrap(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn exactly_one_credential() {
        let account = CloudflareAccount {
            email: "a@a.org".to_string(),
            global_api_key: "key".to_string(),
        };
        let both = Config {
            account: Some(account.clone()),
            api_token: Some("tok".to_string()),
            api_base: None,
        };
        assert!(Dns01Cloudflare::new(&both, &ctx()).is_err());
        assert!(Dns01Cloudflare::new(&Config::default(), &ctx()).is_err());

        let empty_token = Config {
            account: Some(account),
            api_token: Some(String::new()),
            api_base: None,
        };
        assert!(Dns01Cloudflare::new(&empty_token, &ctx()).is_ok());
        assert!(!format!("{:?}", both).contains("\"tok\""));
    }

    #[tokio::test]
    async fn provisions_into_most_specific_zone() {
        let (base, fake) = serve().await;
        let cfg = Config {
            account: None,
            api_token: Some("secret-token".to_string()),
            api_base: Some(base),
        };
        let p = Dns01Cloudflare::new(&cfg, &ctx()).unwrap();
        assert!(p.provision("_acme-challenge.a.com", "v").await.is_err());

        p.start().await.unwrap();
        assert_eq!(fake.auth.lock().unwrap()[0], "Bearer secret-token");

        p.provision("_acme-challenge.x.sub.a.com", "v1").await.unwrap();
        p.provision("_acme-challenge.a.com", "v2").await.unwrap();
        // the create endpoint answers 81057 the second time
        p.provision("_acme-challenge.a.com", "v2").await.unwrap();
        assert!(p.provision("_acme-challenge.ro.com", "v3").await.is_err());
        {
            let records = fake.records.lock().unwrap();
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].1, "z2");
            assert_eq!(records[1].1, "z1");
        }

        p.deprovision("_acme-challenge.a.com", "v2").await.unwrap();
        let records = fake.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].2, "_acme-challenge.x.sub.a.com");
    }
}
