//! Token bucket rate limiter.
//!
//! Tokens accrue at `refill_rate` per second up to `capacity`. Each call
//! consumes its method's cost; when the bucket is short the caller learns how
//! long to wait instead of being rejected by the node.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum tokens in the bucket.
    pub capacity: f64,
    /// Token refill rate (tokens per second).
    pub refill_rate: f64,
    /// Cost of methods not listed in `method_costs`.
    pub default_cost: f64,
    /// Per-method cost overrides.
    pub method_costs: HashMap<String, f64>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_rate: 50.0,
            default_cost: 1.0,
            method_costs: HashMap::new(),
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `cost` tokens, or report how long until they are available.
    pub fn try_acquire(&self, cost: f64) -> Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= cost {
            state.tokens -= cost;
            return Ok(());
        }
        let deficit = cost.min(self.capacity) - state.tokens;
        if self.refill_rate <= 0.0 {
            return Err(Duration::MAX);
        }
        Err(Duration::from_secs_f64(deficit.max(0.0) / self.refill_rate))
    }

    /// Returns currently available tokens.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}

/// Method-aware limiter wrapping one bucket.
pub struct RateLimiter {
    bucket: TokenBucket,
    default_cost: f64,
    method_costs: HashMap<String, f64>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            bucket: TokenBucket::new(config.capacity, config.refill_rate),
            default_cost: config.default_cost,
            method_costs: config.method_costs,
        }
    }

    pub fn cost_of(&self, method: &str) -> f64 {
        self.method_costs
            .get(method)
            .copied()
            .unwrap_or(self.default_cost)
    }

    /// Wait until `method`'s cost is available.
    pub async fn acquire(&self, method: &str) {
        let cost = self.cost_of(method);
        while let Err(wait) = self.bucket.try_acquire(cost) {
            tracing::debug!(method, wait_ms = wait.as_millis() as u64, "rate limited, backing off");
            tokio::time::sleep(wait).await;
        }
    }

    pub fn try_acquire(&self, method: &str) -> Result<(), Duration> {
        self.bucket.try_acquire(self.cost_of(method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: f64, refill_rate: f64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            capacity,
            refill_rate,
            default_cost: 1.0,
            method_costs: [("simulateTransaction".to_string(), 5.0)].into_iter().collect(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_within_capacity() {
        let rl = limiter(10.0, 1.0);
        for _ in 0..10 {
            assert!(rl.try_acquire("getHealth").is_ok());
        }
        assert!(rl.try_acquire("getHealth").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expensive_methods_cost_more() {
        let rl = limiter(6.0, 1.0);
        assert!(rl.try_acquire("simulateTransaction").is_ok());
        let wait = rl.try_acquire("simulateTransaction").unwrap_err();
        assert_eq!(wait, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let rl = limiter(1.0, 10.0);
        rl.acquire("getHealth").await;
        let start = Instant::now();
        rl.acquire("getHealth").await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(100), "{waited:?}");
    }
}
