//! ledgerrpc-core — resilient RPC client core for Soroban-style ledger nodes.
//!
//! # Overview
//!
//! ```text
//! caller ─▶ Dispatcher ─▶ [RateLimiter] ─▶ CircuitBreaker ─▶ Transport ─▶ node
//!                                                                │
//! EventSource ─▶ EventStreamManager ─▶ StateCache ◀── readers    │
//!                         └──▶ subscribers                       │
//! SimulationEngine ─▶ Dispatcher ────────────────────────────────┘
//! ```
//!
//! - [`Connector`] / [`Connection`] — implemented by the wire crates
//! - [`Transport`] — lease strategy: [`TransportPool`] or [`DirectTransport`]
//! - [`policy`] — circuit breaker registry, retry/backoff, rate limiter
//! - [`Dispatcher`] — endpoint selection, retries, deadlines
//! - [`StateCache`] — versioned account/contract state
//! - [`EventStreamManager`] — ordered, deduplicated event subscriptions
//! - [`SimulationEngine`] — `simulateTransaction` dry runs
//! - [`LedgerClient`] — all of the above behind one handle

pub mod cache;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod policy;
pub mod pool;
pub mod request;
pub mod simulation;
pub mod stream;
pub mod transport;

pub use cache::{ApplyOutcome, CacheConfig, CacheStats, CachedState, StateCache, StateKey};
pub use client::{EndpointStats, LedgerClient, LedgerClientBuilder};
pub use config::ClientConfig;
pub use dispatcher::Dispatcher;
pub use endpoint::{BearerToken, Endpoint, Protocol};
pub use error::{ErrorKind, RpcError, ServerError};
pub use policy::{CallPolicy, CircuitBreakerConfig, CircuitState, RetryConfig};
pub use pool::{DirectTransport, PoolConfig, PoolStats, TransportPool};
pub use request::{methods, JsonRpcRequest, JsonRpcResponse, RpcId, RpcRequest, RpcResponse};
pub use simulation::{SimulationEngine, SimulationResult, SimulationVerdict, TransactionIntent};
pub use stream::{
    DeliveryState, EventFilter, EventSource, EventStream, EventStreamManager, LedgerEvent,
    ResyncSnapshot, StreamConfig, StreamStats, StreamUpdate, Subscriber, SubscriptionId,
};
pub use transport::{Connection, Connector, HealthStatus, PooledConnection, Transport};
