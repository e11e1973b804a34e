//! Error taxonomy shared by every component of the client.

use thiserror::Error;

use crate::request::JsonRpcError;

/// A well-formed rejection returned by the node.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    pub code: i64,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl From<JsonRpcError> for ServerError {
    fn from(err: JsonRpcError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Errors surfaced by the RPC client.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Every connection slot for the endpoint stayed leased for the whole acquire timeout.
    #[error("Connection pool exhausted for {endpoint} after waiting {waited_ms}ms")]
    PoolExhausted { endpoint: String, waited_ms: u64 },

    /// Establishing a new physical connection took too long.
    #[error("Connecting to {endpoint} timed out after {ms}ms")]
    ConnectTimeout { endpoint: String, ms: u64 },

    /// The endpoint's circuit breaker is open; no I/O was attempted.
    #[error("Circuit breaker open for endpoint: {endpoint}")]
    CircuitOpen { endpoint: String },

    /// The call deadline (or a single attempt's deadline) elapsed.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Connection refused, reset, malformed frame, unexpected HTTP status, etc.
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON-RPC error object returned by the node.
    #[error("Server error {}: {}", .0.code, .0.message)]
    Server(ServerError),

    /// The node refused to simulate the transaction.
    #[error("Simulation rejected: {reason}")]
    SimulationRejected { reason: String },

    /// A simulation result is older than the configured staleness bound.
    #[error("Simulation result is stale ({age_ms}ms old, limit {limit_ms}ms)")]
    StaleSimulation { age_ms: u64, limit_ms: u64 },

    /// The event subscription ended for good.
    #[error("Subscription closed: {reason}")]
    SubscriptionClosed { reason: String },

    /// No endpoint is configured for the call.
    #[error("No endpoints configured")]
    NoEndpoints,

    /// Invalid construction-time configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A response payload could not be decoded.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

/// Coarse error class used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PoolExhausted,
    ConnectTimeout,
    CircuitOpen,
    Timeout,
    Transport,
    Server,
    Simulation,
    Subscription,
    Other,
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Server(_) => ErrorKind::Server,
            Self::SimulationRejected { .. } | Self::StaleSimulation { .. } => ErrorKind::Simulation,
            Self::SubscriptionClosed { .. } => ErrorKind::Subscription,
            Self::NoEndpoints | Self::Config(_) | Self::Deserialization(_) => ErrorKind::Other,
        }
    }

    /// Returns `true` for transient transport-level failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::ConnectTimeout | ErrorKind::Timeout
        )
    }

    /// Returns `true` if the failure says something about the endpoint's health
    /// and should be counted by its circuit breaker.
    pub fn counts_against_endpoint(&self) -> bool {
        self.is_retryable()
    }

    /// The server error code, if this is a node-side rejection.
    pub fn server_code(&self) -> Option<i64> {
        match self {
            Self::Server(e) => Some(e.code),
            _ => None,
        }
    }

    pub(crate) fn timeout(elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            ms: elapsed.as_millis() as u64,
        }
    }
}
