//! In-process acme server for tests. Routes are scripted per test with `on`.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{Method, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use crate::crypt::base64_decode;

pub(crate) type Responder = Arc<dyn Fn(&MockRequest) -> MockResponse + Send + Sync>;

#[derive(Clone, Debug)]
pub(crate) struct MockRequest {
    pub method: String,
    pub path: String,
    pub protected: Value,
    pub payload: Value,
    pub raw_payload: String,
}

pub(crate) struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub nonce: bool,
}

impl MockResponse {
    pub fn json(status: u16, body: Value) -> Self {
        MockResponse {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.to_string().into_bytes(),
            nonce: true,
        }
    }

    pub fn problem(status: u16, kind: &str, detail: &str) -> Self {
        MockResponse {
            status,
            headers: vec![("content-type".to_string(), "application/problem+json".to_string())],
            body: json!({"type": kind, "detail": detail, "status": status}).to_string().into_bytes(),
            nonce: true,
        }
    }

    pub fn pem(body: &str) -> Self {
        MockResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/pem-certificate-chain".to_string())],
            body: body.as_bytes().to_vec(),
            nonce: true,
        }
    }

    pub fn header(mut self, k: &str, v: &str) -> Self {
        self.headers.push((k.to_string(), v.to_string()));
        self
    }

    pub fn without_nonce(mut self) -> Self {
        self.nonce = false;
        self
    }
}

struct MockState {
    directory: Mutex<Value>,
    nonce_seq: AtomicU64,
    routes: Mutex<HashMap<String, Responder>>,
    requests: Mutex<Vec<MockRequest>>,
}

impl MockState {
    fn next_nonce(&self) -> String {
        format!("mock-nonce-{}", self.nonce_seq.fetch_add(1, Ordering::SeqCst))
    }
}

pub(crate) struct MockAcme {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockAcme {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base = format!("http://{}", addr);
        let directory = json!({
            "newNonce": format!("{}/new-nonce", base),
            "newAccount": format!("{}/new-acct", base),
            "newOrder": format!("{}/new-order", base),
            "revokeCert": format!("{}/revoke-cert", base),
            "keyChange": format!("{}/key-change", base),
            "renewalInfo": format!("{}/renewal-info", base),
            "meta": {"termsOfService": format!("{}/tos", base)}
        });
        let state = Arc::new(MockState {
            directory: Mutex::new(directory),
            nonce_seq: AtomicU64::new(1),
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/directory", get(directory_handler))
            .route("/new-nonce", get(nonce_handler))
            .route("/{*path}", get(dispatch).post(dispatch))
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        MockAcme { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn directory_url(&self) -> String {
        self.url("/directory")
    }

    pub fn set_directory(&self, directory: Value) {
        *self.state.directory.lock().unwrap() = directory;
    }

    pub fn set_terms_of_service(&self, tos: &str) {
        self.state.directory.lock().unwrap()["meta"]["termsOfService"] = Value::String(tos.to_string());
    }

    pub fn on<F>(&self, path: &str, f: F)
    where
        F: Fn(&MockRequest) -> MockResponse + Send + Sync + 'static,
    {
        self.state.routes.lock().unwrap().insert(path.to_string(), Arc::new(f));
    }

    pub fn requests(&self, path: &str) -> Vec<MockRequest> {
        self.state.requests.lock().unwrap().iter().filter(|r| r.path == path).cloned().collect()
    }

    pub fn all_requests(&self) -> Vec<MockRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn directory_handler(State(state): State<Arc<MockState>>) -> Json<Value> {
    Json(state.directory.lock().unwrap().clone())
}

async fn nonce_handler(State(state): State<Arc<MockState>>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("Replay-Nonce", state.next_nonce())
        .header("Cache-Control", "no-store")
        .body(Body::empty())
        .unwrap()
}

fn decode_part(s: &str) -> Value {
    if s.is_empty() {
        return Value::Null;
    }
    base64_decode(s)
        .ok()
        .and_then(|b| serde_json::from_slice(&b).ok())
        .unwrap_or(Value::Null)
}

async fn dispatch(State(state): State<Arc<MockState>>, method: Method, Path(path): Path<String>, body: Bytes) -> Response {
    let path = format!("/{}", path.trim_start_matches('/'));
    let jws: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let raw_payload = jws["payload"].as_str().unwrap_or_default().to_string();
    let request = MockRequest {
        method: method.to_string(),
        path: path.clone(),
        protected: decode_part(jws["protected"].as_str().unwrap_or_default()),
        payload: decode_part(&raw_payload),
        raw_payload,
    };
    state.requests.lock().unwrap().push(request.clone());

    let responder = state.routes.lock().unwrap().get(&path).cloned();
    let res = match responder {
        Some(f) => f(&request),
        None => MockResponse::problem(404, "urn:ietf:params:acme:error:malformed", "no such resource"),
    };

    let mut builder = Response::builder().status(StatusCode::from_u16(res.status).unwrap());
    for (k, v) in &res.headers {
        builder = builder.header(k.as_str(), v.as_str());
    }
    if res.nonce {
        builder = builder.header("Replay-Nonce", state.next_nonce());
    }
    builder.body(Body::from(res.body)).unwrap()
}
