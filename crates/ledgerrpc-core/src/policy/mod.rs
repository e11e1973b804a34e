//! Policy engine — composable reliability gates.
//!
//! Applied per attempt, in order:
//! ```text
//! Request → [RateLimiter] → [CircuitBreaker] → [Transport] → retry per [CallPolicy]
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitRegistry, CircuitState, CircuitStats,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, TokenBucket};
pub use retry::{CallPolicy, RetryConfig, RetryPolicy};
