//! Three-state circuit breaker: Closed → Open → Half-Open, one per endpoint.
//!
//! State transitions:
//! - `Closed` → `Open`:      `failure_threshold` failures inside the sliding `window`
//! - `Open` → `Half-Open`:   `cooldown` has elapsed
//! - `Half-Open` → `Closed`: `success_threshold` probes succeed
//! - `Half-Open` → `Open`:   any probe fails (cooldown restarts)
//!
//! At most `half_open_max_probes` calls are in flight while half-open; the
//! rest are rejected as if the circuit were still open.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::endpoint::Endpoint;
use crate::error::RpcError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// All requests rejected until the cooldown elapses.
    Open,
    /// A bounded number of probe requests test endpoint health.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside `window` that trip the breaker.
    pub failure_threshold: u32,
    /// Length of the sliding failure window.
    pub window: Duration,
    /// How long to stay open before probing.
    pub cooldown: Duration,
    /// Concurrent probe calls admitted while half-open.
    pub half_open_max_probes: u32,
    /// Successful probes needed to close again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
            half_open_max_probes: 1,
            success_threshold: 1,
        }
    }
}

/// Snapshot of a breaker for dashboards and health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failures_in_window: usize,
    pub probes_in_flight: u32,
    pub last_transition: Instant,
}

struct CircuitInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    consecutive_failures: u32,
    probe_successes: u32,
    probes_in_flight: u32,
    last_transition: Instant,
}

impl CircuitInner {
    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.last_transition = Instant::now();
        self.probe_successes = 0;
        self.probes_in_flight = 0;
    }

    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Ticket proving a call was admitted. Pass it back to
/// [`CircuitBreaker::record_success`] or [`CircuitBreaker::record_failure`].
///
/// A probe ticket dropped without a verdict gives its probe slot back.
#[must_use = "report the call outcome to the breaker"]
pub struct Admission {
    probe: Option<ProbeSlot>,
}

impl Admission {
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

struct ProbeSlot {
    shared: Option<Arc<Mutex<CircuitInner>>>,
    opened_at: Instant,
}

impl ProbeSlot {
    /// Give the slot back; returns `false` if the breaker moved on since admission.
    fn release(&mut self) -> bool {
        let Some(shared) = self.shared.take() else {
            return false;
        };
        let mut inner = shared.lock();
        let current =
            inner.state == CircuitState::HalfOpen && inner.last_transition == self.opened_at;
        if current {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
        current
    }

    fn settle(mut self) -> bool {
        self.release()
    }
}

impl Drop for ProbeSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// Thread-safe circuit breaker for one endpoint.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitInner>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in `Closed` state.
    pub fn new(name: impl AsRef<str>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            config,
            inner: Arc::new(Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                consecutive_failures: 0,
                probe_successes: 0,
                probes_in_flight: 0,
                last_transition: Instant::now(),
            })),
        }
    }

    /// Returns the current state, moving Open → HalfOpen once the cooldown has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    fn refresh(&self, inner: &mut CircuitInner) {
        if inner.state == CircuitState::Open && inner.last_transition.elapsed() >= self.config.cooldown {
            inner.transition(CircuitState::HalfOpen);
            tracing::info!(endpoint = %self.name, "circuit breaker → half-open");
        }
    }

    /// Returns `true` if a call would be admitted right now. Does not reserve a probe slot.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.probes_in_flight < self.config.half_open_max_probes,
        }
    }

    /// Admit a call or reject it with `CircuitOpen`.
    pub fn admit(&self) -> Result<Admission, RpcError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(Admission { probe: None }),
            CircuitState::HalfOpen if inner.probes_in_flight < self.config.half_open_max_probes => {
                inner.probes_in_flight += 1;
                Ok(Admission {
                    probe: Some(ProbeSlot {
                        shared: Some(Arc::clone(&self.inner)),
                        opened_at: inner.last_transition,
                    }),
                })
            }
            _ => Err(RpcError::CircuitOpen {
                endpoint: self.name.to_string(),
            }),
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, admission: Admission) {
        let was_probe = match admission.probe {
            Some(slot) => slot.settle(),
            None => false,
        };
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen if was_probe => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.success_threshold {
                    inner.transition(CircuitState::Closed);
                    inner.failures.clear();
                    inner.consecutive_failures = 0;
                    tracing::info!(endpoint = %self.name, "circuit breaker → closed");
                }
            }
            _ => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, admission: Admission) {
        let was_probe = match admission.probe {
            Some(slot) => slot.settle(),
            None => false,
        };
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                inner.failures.push_back(Instant::now());
                inner.prune(self.config.window);
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    let failures = inner.failures.len();
                    inner.transition(CircuitState::Open);
                    tracing::warn!(endpoint = %self.name, failures, "circuit breaker → open");
                }
            }
            CircuitState::HalfOpen if was_probe => {
                inner.transition(CircuitState::Open);
                tracing::warn!(endpoint = %self.name, "circuit breaker probe failed → open");
            }
            _ => {}
        }
    }

    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.prune(self.config.window);
        CircuitStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failures_in_window: inner.failures.len(),
            probes_in_flight: inner.probes_in_flight,
            last_transition: inner.last_transition,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("endpoint", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Per-endpoint breakers, built once per client and shared by handle.
#[derive(Debug, Clone)]
pub struct CircuitRegistry {
    breakers: Arc<HashMap<Endpoint, CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new<'a>(
        endpoints: impl IntoIterator<Item = &'a Endpoint>,
        config: &CircuitBreakerConfig,
    ) -> Self {
        let breakers = endpoints
            .into_iter()
            .map(|ep| (ep.clone(), CircuitBreaker::new(ep.url(), config.clone())))
            .collect();
        Self {
            breakers: Arc::new(breakers),
        }
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<&CircuitBreaker> {
        self.breakers.get(endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Endpoint, &CircuitBreaker)> {
        self.breakers.iter()
    }
}
