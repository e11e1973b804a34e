//! Tuned [`ClientConfig`] presets.
//!
//! - [`hosted`]: SDF public RPC. Free and shared, so retries back off
//!   further, the breaker trips sooner and requests are metered.
//! - [`provider`]: a dedicated or paid endpoint; core defaults with a
//!   generous meter.
//! - [`local`]: a quickstart container on this machine; fail fast, no meter.

use ledgerrpc_core::config::{
    BreakerSettings, ClientConfig, EndpointConfig, RateLimitSettings, RetrySettings,
};
use ledgerrpc_core::error::RpcError;

use crate::network::Network;

/// Requests per second the SDF public endpoints comfortably sustain.
pub const HOSTED_TOKENS_PER_SEC: f64 = 20.0;
pub const PROVIDER_TOKENS_PER_SEC: f64 = 200.0;

fn metered(tokens_per_sec: f64) -> RateLimitSettings {
    RateLimitSettings {
        capacity: tokens_per_sec * 2.0,
        refill_per_sec: tokens_per_sec,
        default_cost: 1.0,
        method_costs: crate::method_costs(),
    }
}

/// Preset for the network's public RPC.
pub fn hosted(network: Network) -> Result<ClientConfig, RpcError> {
    let url = network.rpc_url().ok_or_else(|| {
        RpcError::Config(format!(
            "{network} has no public RPC endpoint; use profiles::provider with your own URL"
        ))
    })?;
    if network == Network::Standalone {
        return Ok(local());
    }

    let mut config = ClientConfig::single(url);
    config.retry = RetrySettings {
        max_retries: 5,
        initial_backoff_ms: 500,
        max_backoff_ms: 30_000,
        jitter_fraction: 0.2,
        deadline_ms: 60_000,
        ..RetrySettings::default()
    };
    config.circuit_breaker = BreakerSettings {
        failure_threshold: 3,
        cooldown_ms: 60_000,
        success_threshold: 2,
        ..BreakerSettings::default()
    };
    config.rate_limit = Some(metered(HOSTED_TOKENS_PER_SEC));
    Ok(config)
}

/// Preset for a dedicated endpoint.
pub fn provider(url: impl Into<String>) -> ClientConfig {
    let mut config = ClientConfig::single(url);
    config.rate_limit = Some(metered(PROVIDER_TOKENS_PER_SEC));
    config
}

/// Preset for a local standalone node.
pub fn local() -> ClientConfig {
    let url = Network::Standalone
        .rpc_url()
        .unwrap_or("http://localhost:8000/soroban/rpc");
    let mut config = ClientConfig::single(url);
    config.pool.connect_timeout_ms = 1_000;
    config.retry = RetrySettings {
        max_retries: 1,
        initial_backoff_ms: 50,
        max_backoff_ms: 500,
        attempt_timeout_ms: 5_000,
        deadline_ms: 10_000,
        ..RetrySettings::default()
    };
    config
}

/// Append `urls` as lower-priority fallbacks, in order.
pub fn with_fallbacks<I, S>(mut config: ClientConfig, urls: I) -> ClientConfig
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let base = config
        .endpoints
        .iter()
        .map(|e| e.priority)
        .max()
        .unwrap_or(0);
    for (i, url) in urls.into_iter().enumerate() {
        let mut endpoint = EndpointConfig::new(url);
        endpoint.priority = base.saturating_add(1 + i as u8);
        config.endpoints.push(endpoint);
    }
    config
}
