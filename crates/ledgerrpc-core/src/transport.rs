//! Transport capability traits.
//!
//! ```text
//! Connector ──connect──▶ Connection        (one physical link, per backend)
//! Transport ──acquire/release/send──▶ PooledConnection   (lease management)
//! ```
//!
//! `Connector`/`Connection` are implemented by wire backends (HTTP, WebSocket).
//! `Transport` is implemented by the lease strategies in this crate:
//! [`TransportPool`](crate::pool::TransportPool) for exclusive pooled leases and
//! [`DirectTransport`](crate::pool::DirectTransport) for one shared multiplexed
//! connection per endpoint.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use crate::endpoint::{BearerToken, Endpoint};
use crate::error::RpcError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// Endpoint or client health as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Every endpoint admits calls.
    Healthy,
    /// Some endpoints are tripped or probing.
    Degraded,
    /// No endpoint admits calls.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One physical connection to an endpoint.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; multiplexing backends may serve
/// several concurrent `send` calls, correlating replies by wire id.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Send one request and wait for the reply carrying the same id.
    async fn send(
        &self,
        req: &JsonRpcRequest,
        auth: Option<&BearerToken>,
    ) -> Result<JsonRpcResponse, RpcError>;

    /// Returns `false` once the underlying link is known to be dead.
    fn is_open(&self) -> bool {
        true
    }

    /// Tear the link down. Called when the pool retires the connection.
    fn close(&self) {}

    /// Whether calls carrying `auth` may ride this link.
    ///
    /// Backends that authenticate per request accept any credential.
    /// Backends that authenticate once at connect time accept only the
    /// credential they connected with, so a rotated token forces a new link.
    fn accepts(&self, auth: Option<&BearerToken>) -> bool {
        let _ = auth;
        true
    }
}

/// Opens physical connections for a given wire protocol.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a link to `endpoint`. `auth` is the credential current at
    /// connect time, for backends that authenticate during the handshake.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        auth: Option<&BearerToken>,
    ) -> Result<Arc<dyn Connection>, RpcError>;
}

/// A lease on one connection, handed out by a [`Transport`].
///
/// Dropping a lease without releasing it frees its capacity slot and discards
/// the connection.
pub struct PooledConnection {
    pub(crate) id: u64,
    pub(crate) endpoint: Endpoint,
    pub(crate) conn: Arc<dyn Connection>,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) in_flight: Arc<AtomicU32>,
    pub(crate) healthy: bool,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub(crate) fn new(
        id: u64,
        endpoint: Endpoint,
        conn: Arc<dyn Connection>,
        in_flight: Arc<AtomicU32>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint,
            conn,
            created_at: now,
            last_used: now,
            in_flight,
            healthy: true,
            permit,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy && self.conn.is_open()
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Send over the leased connection, tracking the in-flight count.
    pub async fn send(
        &mut self,
        req: &JsonRpcRequest,
        auth: Option<&BearerToken>,
    ) -> Result<JsonRpcResponse, RpcError> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let result = self.conn.send(req, auth).await;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.last_used = Instant::now();
        if let Err(e) = &result {
            if e.counts_against_endpoint() {
                self.healthy = false;
            }
        }
        result
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.url())
            .field("healthy", &self.healthy)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Lease strategy the dispatcher routes every attempt through.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Lease a connection to `endpoint` that accepts `auth`, opening one if
    /// needed.
    async fn acquire(
        &self,
        endpoint: &Endpoint,
        auth: Option<&BearerToken>,
    ) -> Result<PooledConnection, RpcError>;

    /// Return a lease. `healthy == false` reports that the attempt failed in
    /// a way that counts against the endpoint.
    fn release(&self, conn: PooledConnection, healthy: bool);

    /// Send one framed request over a leased connection.
    async fn send(
        &self,
        conn: &mut PooledConnection,
        req: &JsonRpcRequest,
        auth: Option<&BearerToken>,
    ) -> Result<JsonRpcResponse, RpcError> {
        conn.send(req, auth).await
    }

    /// Number of connections currently open to `endpoint`.
    fn open_connections(&self, endpoint: &Endpoint) -> usize;
}
