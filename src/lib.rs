pub mod acme;
pub mod backoff;
pub mod challenges;
pub mod config;
pub mod crypt;
pub mod fulfillment;
pub mod orders;

use chrono::Local;
use log::{debug, Level, LevelFilter, Log, Metadata, Record};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::{
    collections::BTreeMap,
    fmt,
    fs::{self, File},
    io::Write,
    path::Path,
    time::{Duration, Instant},
};

pub use acme::{AccountKey, AcmeClient, KeyAlg};
pub use config::AcmeCfg;

const USER_AGENT: &str = concat!("acme-fleet/", env!("CARGO_PKG_VERSION"));
const TIMEOUT_SEC_30: Duration = Duration::from_secs(30); //30s
const FMT_LOCAL_TIME: &str = "%m/%d %H:%M:%S%.3f"; // 07/08 09:53:37.520
const CRATE_TARGET: &str = "acme_fleet";

pub(crate) const CONTENT_TYPE_JOSE: &str = "application/jose+json";
pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";
pub(crate) const HEADER_REPLAY_NONCE: &str = "replay-nonce";
pub(crate) const HEADER_LOCATION: &str = "location";
pub(crate) const HEADER_LINK: &str = "link";
pub(crate) const HEADER_RETRY_AFTER: &str = "retry-after";
pub(crate) const HEADER_CONTENT_TYPE: &str = "content-type";

pub struct AcmeLogger;

impl AcmeLogger {
    pub fn init(level: LevelFilter) -> Result<(), AcmeError> {
        log::set_boxed_logger(Box::new(AcmeLogger)).map_err(|e| AcmeError::Tip(format!("Init logger failed. {}", e)))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for AcmeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // dependencies only get through at warn, or everything when tracing
        metadata.target().starts_with(CRATE_TARGET) || metadata.level() <= Level::Warn || log::max_level() == LevelFilter::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let f = record
            .file()
            .map(|f| Path::new(f).file_name().and_then(|s| s.to_str()).unwrap_or(""))
            .unwrap_or("unknown file");
        let now_local = Local::now().format(FMT_LOCAL_TIME);
        println!(
            "{} {:5} [{}:{}] - {}",
            now_local,
            record.level(),
            f,
            record.line().unwrap_or(0),
            record.args()
        );
    }

    fn flush(&self) {}
}

#[derive(Debug)]
pub enum AcmeError {
    ReqwestError(reqwest::Error),
    IoError(std::io::Error),
    SerdeJsonError(serde_json::Error),
    RegexError(regex::Error),
    /// an acme problem document returned by the server
    Problem(acme::Problem),
    /// non-2xx response without a problem document
    Status { url: String, code: u16 },
    Validation(String),
    Provider(String),
    Propagation(String),
    Key(String),
    Shutdown,
    Tip(String),
}

impl From<reqwest::Error> for AcmeError {
    fn from(error: reqwest::Error) -> Self {
        AcmeError::ReqwestError(error)
    }
}
impl From<std::io::Error> for AcmeError {
    fn from(error: std::io::Error) -> Self {
        AcmeError::IoError(error)
    }
}
impl From<serde_json::Error> for AcmeError {
    fn from(error: serde_json::Error) -> Self {
        AcmeError::SerdeJsonError(error)
    }
}
impl From<regex::Error> for AcmeError {
    fn from(error: regex::Error) -> Self {
        AcmeError::RegexError(error)
    }
}
impl From<acme::Problem> for AcmeError {
    fn from(problem: acme::Problem) -> Self {
        AcmeError::Problem(problem)
    }
}

impl fmt::Display for AcmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcmeError::ReqwestError(e) => write!(f, "http: {}", e),
            AcmeError::IoError(e) => write!(f, "io: {}", e),
            AcmeError::SerdeJsonError(e) => write!(f, "json: {}", e),
            AcmeError::RegexError(e) => write!(f, "regex: {}", e),
            AcmeError::Problem(p) => write!(f, "{}", p),
            AcmeError::Status { url, code } => write!(f, "unexpected status {} from {}", code, url),
            AcmeError::Validation(s) => write!(f, "validation: {}", s),
            AcmeError::Provider(s) => write!(f, "provider: {}", s),
            AcmeError::Propagation(s) => write!(f, "dns propagation: {}", s),
            AcmeError::Key(s) => write!(f, "key: {}", s),
            AcmeError::Shutdown => write!(f, "shutting down"),
            AcmeError::Tip(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for AcmeError {}

impl AcmeError {
    pub(crate) fn tip<T>(s: &str) -> Result<T, AcmeError> {
        Err(AcmeError::Tip(s.to_string()))
    }

    /// The acme error type, if this is a protocol error.
    pub fn problem_type(&self) -> Option<&str> {
        match self {
            AcmeError::Problem(p) => Some(p.kind.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Method {
    POST,
    GET,
    HEAD,
    DELETE,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, key: &str) -> Option<String> {
        self.headers_all(key).into_iter().next().filter(|s| !s.is_empty())
    }

    // 多key情况
    pub fn headers_all(&self, key: &str) -> Vec<String> {
        self.headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok().map(|s| s.to_string()))
            .collect()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Shared outbound client. Every request carries the user agent and a 30s deadline.
#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, AcmeError> {
        let inner = reqwest::Client::builder().user_agent(USER_AGENT).timeout(TIMEOUT_SEC_30).build()?;
        Ok(HttpClient { inner })
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, AcmeError> {
        self.request(url, None, BTreeMap::new(), Method::GET).await
    }

    pub async fn head(&self, url: &str) -> Result<HttpResponse, AcmeError> {
        self.request(url, None, BTreeMap::new(), Method::HEAD).await
    }

    pub async fn post_jose(&self, url: &str, body: String) -> Result<HttpResponse, AcmeError> {
        let headers = vec![(HEADER_CONTENT_TYPE, CONTENT_TYPE_JOSE.to_string())].into_iter().collect();
        self.request(url, Some(body), headers, Method::POST).await
    }

    pub async fn request(
        &self,
        url: &str,
        body: Option<String>,
        headers: BTreeMap<&str, String>,
        method: Method,
    ) -> Result<HttpResponse, AcmeError> {
        let start = Instant::now();
        debug!("==> HTTP {:?}: {}", &method, url);
        log::trace!("==> body: {:?}", &body);

        let cb = match method {
            Method::GET => self.inner.get(url),
            Method::HEAD => self.inner.head(url),
            Method::DELETE => self.inner.delete(url),
            Method::POST => self.inner.post(url),
        };
        let cb = match body {
            Some(body) => cb.body(body),
            None => cb,
        };

        let mut header_map = HeaderMap::new();
        for (k, v) in headers {
            let name = HeaderName::from_bytes(k.as_bytes()).map_err(|e| AcmeError::Tip(format!("Bad header name {}: {}", k, e)))?;
            let value = HeaderValue::from_str(&v).map_err(|e| AcmeError::Tip(format!("Bad header value for {}: {}", k, e)))?;
            header_map.append(name, value);
        }

        let response = cb.headers(header_map).send().await?;
        let (status, headers) = (response.status().as_u16(), response.headers().clone());
        debug!(
            "<== Response: {}, duration: {:.1}s. Header: {:?}",
            status,
            start.elapsed().as_secs_f32(),
            &headers
        );

        let body = response.bytes().await?.to_vec();
        log::trace!("<== Response: {}", String::from_utf8_lossy(&body));
        Ok(HttpResponse { status, headers, body })
    }
}

pub fn create_dir(dir_path: &str) -> Result<(), AcmeError> {
    let path = Path::new(dir_path);
    if !path.exists() {
        debug!("Created path: {:?}", path);
        fs::create_dir_all(path)?;
    }
    Ok(())
}

// 覆盖写入
pub fn write_file(file_path: &str, s: &[u8]) -> Result<(), AcmeError> {
    File::create(file_path)
        .map_err(|e| AcmeError::Tip(format!("Create file failed: {}. {}", file_path, e)))?
        .write_all(s)
        .map_err(|e| AcmeError::Tip(format!("Write failed: {}. {}", file_path, e)))?;
    debug!("Write to {}", file_path);
    Ok(())
}
