//! Exponential backoff with optional jitter, plus the per-call policy the
//! dispatcher applies.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;

use crate::error::{ErrorKind, RpcError};

/// Configuration for exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Add ±`jitter_fraction * backoff` random jitter (0.0 = no jitter).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

/// Stateless retry policy — computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let cap_ms = self.config.max_backoff.as_millis() as f64;
        let capped = base_ms.min(cap_ms);

        let spread = capped * self.config.jitter_fraction.clamp(0.0, 1.0);
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        let total_ms = (capped + jitter).clamp(0.0, cap_ms);

        Some(Duration::from_millis(total_ms as u64))
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_retries
    }
}

/// How the dispatcher treats one call: retries, backoff, deadlines.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub retry: RetryPolicy,
    /// Error classes worth another attempt.
    pub retry_on: HashSet<ErrorKind>,
    /// Server error codes the caller declares transient (e.g. rate limiting).
    pub retryable_server_codes: HashSet<i64>,
    /// Upper bound on one attempt, clipped to the remaining call deadline.
    pub attempt_timeout: Duration,
    /// Default call deadline when the request carries none.
    pub deadline: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(RetryConfig::default()),
            retry_on: [ErrorKind::Transport, ErrorKind::ConnectTimeout, ErrorKind::Timeout]
                .into_iter()
                .collect(),
            retryable_server_codes: HashSet::new(),
            attempt_timeout: Duration::from_secs(10),
            deadline: Duration::from_secs(30),
        }
    }
}

impl CallPolicy {
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryPolicy::new(config);
        self
    }

    pub fn retry_server_code(mut self, code: i64) -> Self {
        self.retryable_server_codes.insert(code);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Never retry; surface the first failure.
    pub fn no_retry(mut self) -> Self {
        self.retry.config.max_retries = 0;
        self
    }

    /// Whether `err` may be retried under this policy. Gate rejections
    /// (`CircuitOpen`, `PoolExhausted`) never are.
    pub fn is_retryable(&self, err: &RpcError) -> bool {
        match err {
            RpcError::CircuitOpen { .. } | RpcError::PoolExhausted { .. } => false,
            RpcError::Server(e) => self.retryable_server_codes.contains(&e.code),
            other => self.retry_on.contains(&other.kind()),
        }
    }
}
