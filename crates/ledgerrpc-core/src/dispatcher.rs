//! Request dispatcher — endpoint selection, retries, deadlines.
//!
//! Each attempt picks the most preferred endpoint whose circuit breaker admits
//! the call (round-robin among equal priorities), leases a connection from the
//! [`Transport`], frames the request with a fresh wire id and checks the reply
//! carries it back. Attempts run as spawned tasks so that when the call
//! deadline fires the caller gets `Timeout` immediately; the abandoned attempt
//! still settles its lease and breaker verdict, but its result is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use crate::endpoint::{BearerToken, Endpoint};
use crate::error::RpcError;
use crate::policy::{
    Admission, CallPolicy, CircuitBreaker, CircuitBreakerConfig, CircuitRegistry, RateLimiter,
    RateLimiterConfig,
};
use crate::request::{IdGenerator, JsonRpcRequest, RpcRequest, RpcResponse};
use crate::transport::{HealthStatus, Transport};

/// Routes application calls through breaker, limiter and transport.
pub struct Dispatcher {
    /// Endpoints grouped by priority, most preferred first.
    tiers: Vec<Vec<Endpoint>>,
    transport: Arc<dyn Transport>,
    breakers: CircuitRegistry,
    limiters: HashMap<Endpoint, Arc<RateLimiter>>,
    credential: RwLock<Option<BearerToken>>,
    ids: IdGenerator,
    cursor: AtomicUsize,
    policy: CallPolicy,
}

impl Dispatcher {
    pub fn new(
        endpoints: Vec<Endpoint>,
        transport: Arc<dyn Transport>,
        breaker: &CircuitBreakerConfig,
        policy: CallPolicy,
    ) -> Result<Self, RpcError> {
        if endpoints.is_empty() {
            return Err(RpcError::NoEndpoints);
        }
        // A URL listed twice keeps its first entry only.
        let mut seen = HashSet::new();
        let mut sorted: Vec<Endpoint> = endpoints
            .into_iter()
            .filter(|ep| seen.insert(ep.url().to_string()))
            .collect();
        let breakers = CircuitRegistry::new(&sorted, breaker);

        sorted.sort_by_key(|ep| ep.priority());
        let mut tiers: Vec<Vec<Endpoint>> = Vec::new();
        for ep in sorted {
            match tiers.last_mut() {
                Some(tier) if tier[0].priority() == ep.priority() => tier.push(ep),
                _ => tiers.push(vec![ep]),
            }
        }

        Ok(Self {
            tiers,
            transport,
            breakers,
            limiters: HashMap::new(),
            credential: RwLock::new(None),
            ids: IdGenerator::new(),
            cursor: AtomicUsize::new(0),
            policy,
        })
    }

    /// Give every endpoint its own token bucket.
    pub fn with_rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.limiters = self
            .endpoints()
            .map(|ep| (ep.clone(), Arc::new(RateLimiter::new(config.clone()))))
            .collect();
        self
    }

    pub fn with_credential(self, token: BearerToken) -> Self {
        *self.credential.write() = Some(token);
        self
    }

    /// Replace (or clear) the credential attached to subsequent calls.
    pub fn set_credential(&self, token: Option<BearerToken>) {
        *self.credential.write() = token;
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.tiers.iter().flatten()
    }

    pub fn breakers(&self) -> &CircuitRegistry {
        &self.breakers
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The policy applied by [`Dispatcher::call`].
    pub fn default_policy(&self) -> &CallPolicy {
        &self.policy
    }

    /// Build a request with a fresh correlation id.
    pub fn request(&self, method: impl Into<String>, params: Value) -> RpcRequest {
        RpcRequest::new(self.ids.next(), method, params)
    }

    /// `Healthy` if every breaker admits calls, `Unhealthy` if none does.
    pub fn health(&self) -> HealthStatus {
        let total = self.breakers.iter().count();
        let allowed = self.breakers.iter().filter(|(_, b)| b.is_allowed()).count();
        match allowed {
            0 => HealthStatus::Unhealthy,
            n if n == total => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        }
    }

    /// Call `method` with the default policy and decode the result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let req = self.request(method, params);
        let resp = self.send(req, &self.policy).await?;
        Ok(serde_json::from_value(resp.result)?)
    }

    /// Send `request`, retrying per `policy` until it succeeds, fails with a
    /// non-retryable error, runs out of attempts or hits its deadline.
    pub async fn send(&self, request: RpcRequest, policy: &CallPolicy) -> Result<RpcResponse, RpcError> {
        let started = Instant::now();
        let deadline = request.deadline.unwrap_or(started + policy.deadline);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RpcError::timeout(started.elapsed()));
            }

            let (endpoint, breaker, admission) = self.select()?;
            let wire = request.to_wire(self.ids.next());
            tracing::debug!(
                id = request.id,
                wire_id = %wire.id,
                method = %request.method,
                endpoint = %endpoint,
                attempt,
                "dispatching"
            );

            let task = tokio::spawn(run_attempt(Attempt {
                transport: Arc::clone(&self.transport),
                limiter: self.limiters.get(&endpoint).cloned(),
                auth: self.credential.read().clone(),
                endpoint: endpoint.clone(),
                breaker,
                admission,
                wire,
                budget: policy.attempt_timeout.min(remaining),
            }));

            let outcome = match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(join)) => Err(RpcError::Transport(format!("attempt aborted: {join}"))),
                Err(_) => {
                    tracing::warn!(
                        id = request.id,
                        method = %request.method,
                        attempt,
                        "call deadline elapsed, abandoning in-flight attempt"
                    );
                    return Err(RpcError::timeout(started.elapsed()));
                }
            };

            let err = match outcome {
                Ok((result, latency)) => {
                    return Ok(RpcResponse {
                        id: request.id,
                        result,
                        latency,
                        endpoint: endpoint.url().to_string(),
                        attempts: attempt,
                    })
                }
                Err(e) => e,
            };

            if !policy.is_retryable(&err) {
                return Err(err);
            }
            let Some(delay) = policy.retry.next_delay(attempt) else {
                return Err(err);
            };
            if Instant::now() + delay >= deadline {
                return Err(err);
            }
            tracing::warn!(
                id = request.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                endpoint = %endpoint,
                error = %err,
                "retrying request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Pick the first admitting endpoint, tier by tier.
    fn select(&self) -> Result<(Endpoint, CircuitBreaker, Admission), RpcError> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for tier in &self.tiers {
            for i in 0..tier.len() {
                let endpoint = &tier[(start + i) % tier.len()];
                let Some(breaker) = self.breakers.get(endpoint) else {
                    continue;
                };
                if let Ok(admission) = breaker.admit() {
                    return Ok((endpoint.clone(), breaker.clone(), admission));
                }
            }
        }
        let endpoint = self
            .endpoints()
            .map(Endpoint::url)
            .collect::<Vec<_>>()
            .join(", ");
        Err(RpcError::CircuitOpen { endpoint })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("endpoints", &self.endpoints().map(Endpoint::url).collect::<Vec<_>>())
            .field("rate_limited", &!self.limiters.is_empty())
            .finish()
    }
}

struct Attempt {
    transport: Arc<dyn Transport>,
    limiter: Option<Arc<RateLimiter>>,
    auth: Option<BearerToken>,
    endpoint: Endpoint,
    breaker: CircuitBreaker,
    admission: Admission,
    wire: JsonRpcRequest,
    budget: Duration,
}

/// One attempt against one endpoint. Always settles the lease and, when the
/// endpoint was actually exercised, the breaker.
async fn run_attempt(attempt: Attempt) -> Result<(Value, Duration), RpcError> {
    let Attempt {
        transport,
        limiter,
        auth,
        endpoint,
        breaker,
        admission,
        wire,
        budget,
    } = attempt;
    let attempt_deadline = Instant::now() + budget;

    if let Some(limiter) = limiter {
        if tokio::time::timeout_at(attempt_deadline, limiter.acquire(&wire.method))
            .await
            .is_err()
        {
            return Err(RpcError::timeout(budget));
        }
    }

    let acquire = transport.acquire(&endpoint, auth.as_ref());
    let mut lease = match tokio::time::timeout_at(attempt_deadline, acquire).await {
        Ok(Ok(lease)) => lease,
        Ok(Err(e)) => {
            if e.counts_against_endpoint() {
                breaker.record_failure(admission);
            }
            return Err(e);
        }
        Err(_) => return Err(RpcError::timeout(budget)),
    };

    let sent_at = Instant::now();
    let result = match tokio::time::timeout_at(
        attempt_deadline,
        transport.send(&mut lease, &wire, auth.as_ref()),
    )
    .await
    {
        Ok(Ok(resp)) if resp.id != wire.id => Err(RpcError::Transport(format!(
            "response id {} does not match request id {}",
            resp.id, wire.id
        ))),
        Ok(result) => result,
        Err(_) => Err(RpcError::timeout(budget)),
    };
    let latency = sent_at.elapsed();

    match result {
        Ok(resp) => {
            breaker.record_success(admission);
            let healthy = lease.is_healthy();
            transport.release(lease, healthy);
            resp.into_result()
                .map(|value| (value, latency))
                .map_err(|e| RpcError::Server(e.into()))
        }
        Err(e) if e.counts_against_endpoint() => {
            tracing::debug!(endpoint = %endpoint, error = %e, "attempt failed, releasing connection as unhealthy");
            breaker.record_failure(admission);
            transport.release(lease, false);
            Err(e)
        }
        Err(e) => {
            breaker.record_success(admission);
            let healthy = lease.is_healthy();
            transport.release(lease, healthy);
            Err(e)
        }
    }
}
