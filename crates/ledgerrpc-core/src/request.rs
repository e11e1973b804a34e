//! JSON-RPC 2.0 wire types and the dispatcher's request/response envelopes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Soroban RPC method names used by the client.
pub mod methods {
    pub const GET_HEALTH: &str = "getHealth";
    pub const GET_NETWORK: &str = "getNetwork";
    pub const GET_LATEST_LEDGER: &str = "getLatestLedger";
    pub const GET_LEDGER_ENTRIES: &str = "getLedgerEntries";
    pub const GET_EVENTS: &str = "getEvents";
    pub const GET_TRANSACTION: &str = "getTransaction";
    pub const SIMULATE_TRANSACTION: &str = "simulateTransaction";
    pub const SEND_TRANSACTION: &str = "sendTransaction";
}

/// JSON-RPC request ID — string, number, or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl RpcId {
    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A JSON-RPC 2.0 request as it goes over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    pub id: RpcId,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response as it comes off the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: RpcId::Number(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: RpcId::Number(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Returns `true` if this is a successful response (has result, no error).
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }

    /// Unwrap the result value or return the error object.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Hands out unique ids for correlation and wire framing.
///
/// One generator lives inside each client; there is no process-wide counter.
#[derive(Debug)]
pub struct IdGenerator(AtomicU64);

impl IdGenerator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// An application call handed to the dispatcher.
///
/// `id` correlates the call across retries; each attempt is framed with its
/// own wire id so a late reply to an abandoned attempt can never be mistaken
/// for the reply to a newer one.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
    /// Absolute deadline for the whole call, retries included.
    pub deadline: Option<Instant>,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub(crate) fn to_wire(&self, wire_id: u64) -> JsonRpcRequest {
        JsonRpcRequest::new(wire_id, self.method.clone(), self.params.clone())
    }
}

/// A successful reply to an [`RpcRequest`].
#[derive(Debug, Clone)]
pub struct RpcResponse {
    /// Correlation id of the originating request.
    pub id: u64,
    pub result: Value,
    /// Client-measured round trip of the attempt that produced this
    /// response: from handing the request to the leased connection until its
    /// reply arrived. Excludes lease and rate-limit waits, backoff and earlier
    /// attempts. Nodes do not report their own processing time, so this is
    /// not a server-side figure.
    pub latency: Duration,
    /// URL of the endpoint that answered.
    pub endpoint: String,
    /// Number of attempts made, including the successful one.
    pub attempts: u32,
}
