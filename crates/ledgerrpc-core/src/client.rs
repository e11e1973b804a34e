//! `LedgerClient` — one handle over every component.
//!
//! The client owns its breaker registry, cache, pool and subscriptions; there
//! is no shared global state, so independent clients never interfere.
//!
//! # Example
//! ```rust,ignore
//! let client = LedgerClient::builder(ClientConfig::single("https://soroban-testnet.stellar.org"))
//!     .connector(Arc::new(HttpConnector::default_client()?))
//!     .build()?;
//! let ledger: serde_json::Value = client.call("getLatestLedger", serde_json::Value::Null).await?;
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::cache::{CachedState, StateCache, StateKey};
use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::endpoint::BearerToken;
use crate::error::RpcError;
use crate::policy::{CallPolicy, CircuitStats};
use crate::pool::{DirectTransport, PoolStats, TransportPool};
use crate::request::{RpcRequest, RpcResponse};
use crate::simulation::{SimulationEngine, SimulationResult, TransactionIntent};
use crate::stream::{
    DeliveryState, EventFilter, EventSource, EventStreamManager, StreamStats, Subscriber,
    SubscriptionId,
};
use crate::transport::{Connector, HealthStatus, Transport};

/// Per-endpoint view for health dashboards.
#[derive(Debug, Clone)]
pub struct EndpointStats {
    pub url: String,
    pub circuit: CircuitStats,
    pub open_connections: usize,
    /// Slot usage when the endpoint is served by a [`TransportPool`].
    pub pool: Option<PoolStats>,
}

/// Builder for [`LedgerClient`].
pub struct LedgerClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    transport: Option<Arc<dyn Transport>>,
    events: Option<Arc<dyn EventSource>>,
    credential: Option<BearerToken>,
}

impl LedgerClientBuilder {
    /// Wire backend used to open connections.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use a ready-made transport instead of building one from the connector.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Enable subscriptions through `source`.
    pub fn event_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.events = Some(source);
        self
    }

    pub fn credential(mut self, token: BearerToken) -> Self {
        self.credential = Some(token);
        self
    }

    pub fn build(self) -> Result<LedgerClient, RpcError> {
        let config = self.config;
        config.validate()?;

        let mut pool = None;
        let transport: Arc<dyn Transport> = match (self.transport, self.connector) {
            (Some(transport), _) => transport,
            (None, Some(connector)) if config.pool.multiplexed => Arc::new(DirectTransport::new(
                connector,
                config.pool_config().connect_timeout,
            )),
            (None, Some(connector)) => {
                let p = Arc::new(TransportPool::new(connector, config.pool_config()));
                pool = Some(Arc::clone(&p));
                p
            }
            (None, None) => {
                return Err(RpcError::Config(
                    "a connector or transport is required".into(),
                ))
            }
        };

        let reaper = match (&pool, config.reaper_interval()) {
            (Some(p), Some(interval)) if tokio::runtime::Handle::try_current().is_ok() => {
                Some(p.spawn_reaper(interval))
            }
            _ => None,
        };

        let mut dispatcher = Dispatcher::new(
            config.endpoints(),
            transport,
            &config.breaker_config(),
            config.call_policy(),
        )?;
        if let Some(limits) = config.rate_limiter_config() {
            dispatcher = dispatcher.with_rate_limit(limits);
        }
        if let Some(token) = self.credential {
            dispatcher = dispatcher.with_credential(token);
        }
        let dispatcher = Arc::new(dispatcher);

        let cache = StateCache::new(config.cache_config());
        let simulation = SimulationEngine::new(Arc::clone(&dispatcher), config.simulation_staleness());
        let streams = self
            .events
            .map(|source| EventStreamManager::new(source, cache.clone(), config.stream_config()));

        tracing::info!(
            endpoints = config.endpoints.len(),
            pooled = pool.is_some(),
            streaming = streams.is_some(),
            "ledger client ready"
        );

        Ok(LedgerClient {
            dispatcher,
            cache,
            simulation,
            streams,
            pool,
            reaper,
        })
    }
}

/// Resilient client for a Soroban-style ledger RPC service.
pub struct LedgerClient {
    dispatcher: Arc<Dispatcher>,
    cache: StateCache,
    simulation: SimulationEngine,
    streams: Option<EventStreamManager>,
    pool: Option<Arc<TransportPool>>,
    reaper: Option<JoinHandle<()>>,
}

impl LedgerClient {
    pub fn builder(config: ClientConfig) -> LedgerClientBuilder {
        LedgerClientBuilder {
            config,
            connector: None,
            transport: None,
            events: None,
            credential: None,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Build a request with a fresh correlation id.
    pub fn request(&self, method: impl Into<String>, params: Value) -> RpcRequest {
        self.dispatcher.request(method, params)
    }

    pub async fn send(&self, request: RpcRequest, policy: &CallPolicy) -> Result<RpcResponse, RpcError> {
        self.dispatcher.send(request, policy).await
    }

    /// Call `method` with the configured policy and decode the result.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        self.dispatcher.call(method, params).await
    }

    /// Rotate the credential attached to outbound calls.
    pub fn set_credential(&self, token: Option<BearerToken>) {
        self.dispatcher.set_credential(token);
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn get(&self, key: &StateKey) -> Option<Arc<CachedState>> {
        self.cache.get(key)
    }

    pub async fn simulate(&self, intent: &TransactionIntent) -> Result<SimulationResult, RpcError> {
        self.simulation.simulate(intent).await
    }

    /// Refuse a simulation older than the configured staleness bound.
    pub fn ensure_fresh(&self, result: &SimulationResult) -> Result<(), RpcError> {
        self.simulation.ensure_fresh(result)
    }

    fn streams(&self) -> Result<&EventStreamManager, RpcError> {
        self.streams
            .as_ref()
            .ok_or_else(|| RpcError::Config("no event source configured".into()))
    }

    pub fn subscribe(&self, filter: EventFilter, resume_after: Option<u64>) -> Result<Subscriber, RpcError> {
        Ok(self.streams()?.subscribe(filter, resume_after))
    }

    pub fn attach(&self, id: SubscriptionId) -> Result<Subscriber, RpcError> {
        self.streams()?.attach(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.streams
            .as_ref()
            .map(|s| s.unsubscribe(id))
            .unwrap_or(false)
    }

    pub fn subscription_state(&self, id: SubscriptionId) -> Option<DeliveryState> {
        self.streams.as_ref().and_then(|s| s.state(id))
    }

    pub fn subscription_stats(&self, id: SubscriptionId) -> Option<StreamStats> {
        self.streams.as_ref().and_then(|s| s.stats(id))
    }

    /// Aggregate breaker health across endpoints.
    pub fn health(&self) -> HealthStatus {
        self.dispatcher.health()
    }

    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        let transport = self.dispatcher.transport();
        self.dispatcher
            .endpoints()
            .filter_map(|ep| {
                let breaker = self.dispatcher.breakers().get(ep)?;
                Some(EndpointStats {
                    url: ep.url().to_string(),
                    circuit: breaker.stats(),
                    open_connections: transport.open_connections(ep),
                    pool: self.pool.as_ref().map(|p| p.stats(ep)),
                })
            })
            .collect()
    }

    /// Close every subscription and stop background maintenance.
    pub async fn shutdown(&self) {
        if let Some(streams) = &self.streams {
            streams.shutdown().await;
        }
        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }
    }
}

impl Drop for LedgerClient {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

impl std::fmt::Debug for LedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerClient")
            .field("dispatcher", &self.dispatcher)
            .field("cache", &self.cache)
            .field("streams", &self.streams)
            .finish()
    }
}
