use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, RwLock},
};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::ProviderContext;
use crate::AcmeError;

const DEFAULT_BIND: &str = "0.0.0.0";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    #[serde(default)]
    pub bind: Option<String>,
}

type Tokens = Arc<RwLock<HashMap<String, String>>>;

struct Running {
    addr: SocketAddr,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Serves `/.well-known/acme-challenge/{token}` from an in-memory map.
pub struct Http01Internal {
    bind: String,
    port: u16,
    tokens: Tokens,
    parent: CancellationToken,
    running: Mutex<Option<Running>>,
}

impl Http01Internal {
    pub fn new(cfg: &Config, ctx: &ProviderContext) -> Self {
        Http01Internal {
            bind: cfg.bind.clone().unwrap_or_else(|| DEFAULT_BIND.to_string()),
            port: cfg.port,
            tokens: Arc::new(RwLock::new(HashMap::new())),
            parent: ctx.cancel.clone(),
            running: Mutex::new(None),
        }
    }

    /// Where the server is listening, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).as_ref().map(|r| r.addr)
    }

    pub async fn start(&self) -> Result<(), AcmeError> {
        if self.local_addr().is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind((self.bind.as_str(), self.port))
            .await
            .map_err(|e| AcmeError::Provider(format!("http-01 server cannot bind {}:{}. {}", self.bind, self.port, e)))?;
        let addr = listener.local_addr()?;
        if self.port != 80 {
            warn!("http-01 server is not on port 80; port 80 must be proxied to {}", addr.port());
        }

        let app = Router::new()
            .route("/.well-known/acme-challenge/{token}", get(serve_token))
            .with_state(self.tokens.clone());
        let stop = self.parent.child_token();
        let shutdown = stop.clone();
        let handle = tokio::spawn(async move {
            let res = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = res {
                error!("http-01 server {} failed. {}", addr, e);
            }
            info!("http-01 server {} shutdown complete", addr);
        });

        info!("http-01 server listening on {}", addr);
        *self.running.lock().unwrap_or_else(|e| e.into_inner()) = Some(Running { addr, stop, handle });
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), AcmeError> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(r) = running {
            r.stop.cancel();
            r.handle
                .await
                .map_err(|e| AcmeError::Provider(format!("http-01 server {} did not stop cleanly. {}", r.addr, e)))?;
        }
        Ok(())
    }

    pub fn provision(&self, token: &str, key_auth: &str) -> Result<(), AcmeError> {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        match tokens.get(token) {
            Some(existing) if existing != key_auth => {
                Err(AcmeError::Provider(format!("http-01 token {} already in use", token)))
            }
            _ => {
                tokens.insert(token.to_string(), key_auth.to_string());
                Ok(())
            }
        }
    }

    pub fn deprovision(&self, token: &str, _key_auth: &str) -> Result<(), AcmeError> {
        self.tokens.write().unwrap_or_else(|e| e.into_inner()).remove(token);
        Ok(())
    }
}

async fn serve_token(State(tokens): State<Tokens>, Path(token): Path<String>) -> Response {
    let value = tokens.read().unwrap_or_else(|e| e.into_inner()).get(&token).cloned();
    match value {
        Some(v) => {
            debug!("http-01 serving token {}", token);
            ([(header::CONTENT_TYPE, "application/octet-stream")], v).into_response()
        }
        None => {
            debug!("http-01 token {} not found", token);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpClient;

    fn provider(cancel: CancellationToken) -> Http01Internal {
        let cfg = Config {
            port: 0,
            bind: Some("127.0.0.1".to_string()),
        };
        let ctx = ProviderContext {
            http: HttpClient::new().unwrap(),
            cancel,
        };
        Http01Internal::new(&cfg, &ctx)
    }

    #[tokio::test]
    async fn serves_provisioned_tokens() {
        let p = provider(CancellationToken::new());
        p.start().await.unwrap();
        let addr = p.local_addr().unwrap();
        let http = HttpClient::new().unwrap();
        let url = format!("http://{}/.well-known/acme-challenge/tok1", addr);

        assert_eq!(http.get(&url).await.unwrap().status, 404);

        p.provision("tok1", "tok1.thumb").unwrap();
        let res = http.get(&url).await.unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.text(), "tok1.thumb");

        assert!(p.provision("tok1", "other").is_err());
        p.deprovision("tok1", "tok1.thumb").unwrap();
        assert_eq!(http.get(&url).await.unwrap().status, 404);

        p.stop().await.unwrap();
        assert!(p.local_addr().is_none());
    }

    #[tokio::test]
    async fn parent_cancel_stops_server() {
        let cancel = CancellationToken::new();
        let p = provider(cancel.clone());
        p.start().await.unwrap();
        cancel.cancel();
        // the task exits on its own; stop only reaps it
        p.stop().await.unwrap();
    }
}
