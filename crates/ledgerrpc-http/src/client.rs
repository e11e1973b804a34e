//! HTTP JSON-RPC connector backed by `reqwest`.
//!
//! HTTP has no persistent session to multiplex, so an [`HttpConnection`] is a
//! cheap handle onto reqwest's internal keep-alive pool. The core
//! [`TransportPool`](ledgerrpc_core::TransportPool) still bounds how many
//! requests run concurrently per endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ledgerrpc_core::endpoint::{BearerToken, Endpoint};
use ledgerrpc_core::error::RpcError;
use ledgerrpc_core::request::{methods, JsonRpcRequest, JsonRpcResponse};
use ledgerrpc_core::transport::{Connection, Connector};

/// Configuration for [`HttpConnector`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Hard cap on one HTTP exchange; the dispatcher's attempt timeout is
    /// usually shorter.
    pub request_timeout: Duration,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Send `getHealth` when a connection is opened and fail the connect if
    /// the node does not answer.
    pub probe_on_connect: bool,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            probe_on_connect: false,
            user_agent: concat!("ledgerrpc/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Opens [`HttpConnection`]s.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
    config: HttpConfig,
}

impl HttpConnector {
    pub fn new(config: HttpConfig) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| RpcError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Create with default configuration.
    pub fn default_client() -> Result<Self, RpcError> {
        Self::new(HttpConfig::default())
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _auth: Option<&BearerToken>,
    ) -> Result<Arc<dyn Connection>, RpcError> {
        let conn = HttpConnection {
            url: endpoint.url().to_string(),
            http: self.http.clone(),
            request_timeout: self.config.request_timeout,
            open: AtomicBool::new(true),
        };
        if self.config.probe_on_connect {
            let probe = JsonRpcRequest::new(0, methods::GET_HEALTH, serde_json::Value::Null);
            conn.send(&probe, None).await?;
            tracing::debug!(url = %conn.url, "health probe answered");
        }
        Ok(Arc::new(conn))
    }
}

/// One endpoint's JSON-RPC-over-HTTP link.
#[derive(Debug)]
pub struct HttpConnection {
    url: String,
    http: reqwest::Client,
    request_timeout: Duration,
    open: AtomicBool,
}

impl HttpConnection {
    pub fn url(&self) -> &str {
        &self.url
    }
}

fn map_reqwest(err: reqwest::Error, timeout: Duration) -> RpcError {
    if err.is_timeout() {
        RpcError::Timeout {
            ms: timeout.as_millis() as u64,
        }
    } else if err.is_decode() {
        RpcError::Transport(format!("malformed response body: {err}"))
    } else {
        RpcError::Transport(err.to_string())
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn send(
        &self,
        req: &JsonRpcRequest,
        auth: Option<&BearerToken>,
    ) -> Result<JsonRpcResponse, RpcError> {
        let mut builder = self.http.post(&self.url).json(req);
        if let Some(token) = auth {
            builder = builder.bearer_auth(token.expose());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| map_reqwest(e, self.request_timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(url = %self.url, status, "non-success HTTP status");
            return Err(RpcError::Transport(format!("HTTP {status}: {body}")));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| map_reqwest(e, self.request_timeout))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}
