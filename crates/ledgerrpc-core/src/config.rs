//! Construction-time configuration.
//!
//! `ClientConfig` is plain serde data (durations as `_ms` integers) so it can
//! be loaded from JSON by the embedding application. Every section has the
//! defaults documented on the component it configures.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::endpoint::{Endpoint, Protocol};
use crate::error::RpcError;
use crate::policy::{CallPolicy, CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
use crate::pool::PoolConfig;
use crate::stream::StreamConfig;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    /// Inferred from the URL scheme when absent.
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub region: Option<String>,
    /// Lower is preferred.
    #[serde(default)]
    pub priority: u8,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocol: None,
            region: None,
            priority: 0,
        }
    }

    pub fn to_endpoint(&self) -> Endpoint {
        let protocol = self
            .protocol
            .or_else(|| Protocol::from_url(&self.url))
            .unwrap_or(Protocol::Http);
        let mut builder = Endpoint::builder(self.url.clone(), protocol).priority(self.priority);
        if let Some(region) = &self.region {
            builder = builder.region(region.clone());
        }
        builder.build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub capacity_per_endpoint: usize,
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_idle_ms: u64,
    /// How often idle connections are reaped; 0 disables the reaper.
    pub reaper_interval_ms: u64,
    /// Share one multiplexed connection per endpoint instead of pooling.
    pub multiplexed: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity_per_endpoint: 8,
            acquire_timeout_ms: 2_000,
            connect_timeout_ms: 5_000,
            max_idle_ms: 60_000,
            reaper_interval_ms: 30_000,
            multiplexed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub window_ms: u64,
    pub cooldown_ms: u64,
    pub half_open_max_probes: u32,
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 10_000,
            cooldown_ms: 30_000,
            half_open_max_probes: 1,
            success_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter_fraction: f64,
    pub attempt_timeout_ms: u64,
    pub deadline_ms: u64,
    /// Server error codes worth retrying (e.g. rate limiting).
    pub retryable_server_codes: Vec<i64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter_fraction: 0.1,
            attempt_timeout_ms: 10_000,
            deadline_ms: 30_000,
            retryable_server_codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub default_cost: f64,
    pub method_costs: HashMap<String, f64>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_per_sec: 50.0,
            default_cost: 1.0,
            method_costs: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub capacity: usize,
    /// `null` keeps entries until evicted.
    pub ttl_ms: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_ms: Some(300_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 60_000,
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub staleness_ms: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self { staleness_ms: 30_000 }
    }
}

/// Everything a [`LedgerClient`](crate::client::LedgerClient) needs at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Client-side rate limiting; off when absent.
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
}

impl ClientConfig {
    /// Defaults everywhere, talking to a single endpoint.
    pub fn single(url: impl Into<String>) -> Self {
        Self {
            endpoints: vec![EndpointConfig::new(url)],
            pool: PoolSettings::default(),
            circuit_breaker: BreakerSettings::default(),
            retry: RetrySettings::default(),
            rate_limit: None,
            cache: CacheSettings::default(),
            stream: StreamSettings::default(),
            simulation: SimulationSettings::default(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, RpcError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the components cannot run with.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.endpoints.is_empty() {
            return Err(RpcError::NoEndpoints);
        }
        for ep in &self.endpoints {
            if ep.protocol.is_none() && Protocol::from_url(&ep.url).is_none() {
                return Err(RpcError::Config(format!(
                    "endpoint {} has no recognised scheme (http, https, ws, wss)",
                    ep.url
                )));
            }
        }
        let checks: [(bool, &str); 9] = [
            (self.pool.capacity_per_endpoint > 0, "pool.capacity_per_endpoint must be positive"),
            (self.pool.acquire_timeout_ms > 0, "pool.acquire_timeout_ms must be positive"),
            (self.circuit_breaker.failure_threshold > 0, "circuit_breaker.failure_threshold must be positive"),
            (self.circuit_breaker.half_open_max_probes > 0, "circuit_breaker.half_open_max_probes must be positive"),
            (self.circuit_breaker.success_threshold > 0, "circuit_breaker.success_threshold must be positive"),
            (self.retry.multiplier >= 1.0, "retry.multiplier must be at least 1.0"),
            ((0.0..=1.0).contains(&self.retry.jitter_fraction), "retry.jitter_fraction must be within 0..=1"),
            (self.retry.deadline_ms > 0 && self.retry.attempt_timeout_ms > 0, "retry deadlines must be positive"),
            (self.cache.capacity > 0, "cache.capacity must be positive"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(RpcError::Config((*msg).to_string())),
            None => Ok(()),
        }
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.iter().map(EndpointConfig::to_endpoint).collect()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            capacity_per_endpoint: self.pool.capacity_per_endpoint,
            acquire_timeout: ms(self.pool.acquire_timeout_ms),
            connect_timeout: ms(self.pool.connect_timeout_ms),
            max_idle: ms(self.pool.max_idle_ms),
        }
    }

    pub fn reaper_interval(&self) -> Option<Duration> {
        (self.pool.reaper_interval_ms > 0).then(|| ms(self.pool.reaper_interval_ms))
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        let b = &self.circuit_breaker;
        CircuitBreakerConfig {
            failure_threshold: b.failure_threshold,
            window: ms(b.window_ms),
            cooldown: ms(b.cooldown_ms),
            half_open_max_probes: b.half_open_max_probes,
            success_threshold: b.success_threshold,
        }
    }

    pub fn call_policy(&self) -> CallPolicy {
        let r = &self.retry;
        let mut policy = CallPolicy::default()
            .with_retry(RetryConfig {
                max_retries: r.max_retries,
                initial_backoff: ms(r.initial_backoff_ms),
                max_backoff: ms(r.max_backoff_ms),
                multiplier: r.multiplier,
                jitter_fraction: r.jitter_fraction,
            })
            .with_attempt_timeout(ms(r.attempt_timeout_ms))
            .with_deadline(ms(r.deadline_ms));
        for code in &r.retryable_server_codes {
            policy = policy.retry_server_code(*code);
        }
        policy
    }

    pub fn rate_limiter_config(&self) -> Option<RateLimiterConfig> {
        self.rate_limit.as_ref().map(|r| RateLimiterConfig {
            capacity: r.capacity,
            refill_rate: r.refill_per_sec,
            default_cost: r.default_cost,
            method_costs: r.method_costs.clone(),
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache.capacity,
            ttl: self.cache.ttl_ms.map(ms),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        let s = &self.stream;
        StreamConfig {
            reconnect: RetryConfig {
                max_retries: s.max_reconnect_attempts,
                initial_backoff: ms(s.reconnect_initial_ms),
                max_backoff: ms(s.reconnect_max_ms),
                multiplier: 2.0,
                jitter_fraction: 0.1,
            },
        }
    }

    pub fn simulation_staleness(&self) -> Duration {
        ms(self.simulation.staleness_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_gets_defaults() {
        let config = ClientConfig::from_json(
            r#"{ "endpoints": [{ "url": "https://soroban-testnet.stellar.org" }] }"#,
        )
        .unwrap();
        assert_eq!(config.pool.capacity_per_endpoint, 8);
        assert_eq!(config.breaker_config().window, Duration::from_secs(10));
        assert_eq!(config.call_policy().deadline, Duration::from_secs(30));
        assert_eq!(config.stream_config().reconnect.max_retries, 5);
        assert_eq!(config.cache_config().ttl, Some(Duration::from_secs(300)));
        assert!(config.rate_limiter_config().is_none());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = ClientConfig::from_json(
            r#"{
                "endpoints": [
                    { "url": "wss://rpc.example/ws", "priority": 1, "region": "eu" },
                    { "url": "https://rpc.example" }
                ],
                "circuit_breaker": { "cooldown_ms": 10000 },
                "retry": { "retryable_server_codes": [429] }
            }"#,
        )
        .unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.breaker_config().cooldown, Duration::from_secs(10));
        assert!(config.call_policy().retryable_server_codes.contains(&429));

        let endpoints = config.endpoints();
        assert_eq!(endpoints[0].protocol(), Protocol::WebSocket);
        assert_eq!(endpoints[0].region(), Some("eu"));
        assert_eq!(endpoints[0].priority(), 1);
    }

    #[test]
    fn rejects_unusable_configs() {
        assert!(matches!(
            ClientConfig::from_json(r#"{ "endpoints": [] }"#),
            Err(RpcError::NoEndpoints)
        ));
        assert!(matches!(
            ClientConfig::single("ftp://rpc.example").validate(),
            Err(RpcError::Config(_))
        ));
        let mut config = ClientConfig::single("https://rpc.example");
        config.pool.capacity_per_endpoint = 0;
        assert!(matches!(config.validate(), Err(RpcError::Config(_))));
    }
}
