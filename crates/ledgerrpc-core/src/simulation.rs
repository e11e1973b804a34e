//! Simulation engine — dry-run transactions through `simulateTransaction`.
//!
//! Simulations mutate no ledger state, so they are always retryable. Results
//! are owned by the caller, never cached, and stamped with the time they were
//! produced so stale estimates can be refused before submission.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::policy::CallPolicy;
use crate::request::methods;

/// A transaction to dry-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionIntent {
    /// Base64 `TransactionEnvelope` XDR. Built and signed elsewhere.
    pub envelope_xdr: String,
    /// Extra CPU instructions to budget on top of the node's estimate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_leeway: Option<u64>,
}

impl TransactionIntent {
    pub fn new(envelope_xdr: impl Into<String>) -> Self {
        Self {
            envelope_xdr: envelope_xdr.into(),
            instruction_leeway: None,
        }
    }

    pub fn with_instruction_leeway(mut self, leeway: u64) -> Self {
        self.instruction_leeway = Some(leeway);
        self
    }

    fn params(&self) -> Value {
        match self.instruction_leeway {
            Some(leeway) => json!({
                "transaction": self.envelope_xdr,
                "resourceConfig": { "instructionLeeway": leeway },
            }),
            None => json!({ "transaction": self.envelope_xdr }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCost {
    pub cpu_insns: u64,
    pub mem_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Predicted change to one ledger entry (XDR encoded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    #[serde(rename = "type")]
    pub kind: StateChangeKind,
    pub key: String,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
}

/// Return value and required authorisations of one host function invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResult {
    #[serde(default)]
    pub xdr: String,
    #[serde(default)]
    pub auth: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationVerdict {
    /// The transaction can be submitted as simulated.
    Success,
    /// Archived entries must be restored first, at this extra cost.
    RestoreRequired {
        min_resource_fee: u64,
        transaction_data: String,
    },
}

/// Predicted effect and cost of a transaction.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub latest_ledger: u32,
    /// Minimum resource fee in stroops.
    pub min_resource_fee: u64,
    pub cost: ResourceCost,
    /// `SorobanTransactionData` XDR to attach before signing.
    pub transaction_data: Option<String>,
    pub results: Vec<InvocationResult>,
    /// Diagnostic and contract events, as XDR.
    pub events: Vec<String>,
    pub state_changes: Vec<StateChange>,
    pub verdict: SimulationVerdict,
    pub simulated_at: Instant,
}

impl SimulationResult {
    pub fn age(&self) -> Duration {
        self.simulated_at.elapsed()
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() <= max_age
    }

    pub fn succeeded(&self) -> bool {
        self.verdict == SimulationVerdict::Success
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }
    match NumOrStr::deserialize(de)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCost {
    #[serde(default, deserialize_with = "lenient_u64")]
    cpu_insns: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    mem_bytes: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRestorePreamble {
    #[serde(default, deserialize_with = "lenient_u64")]
    min_resource_fee: u64,
    #[serde(default)]
    transaction_data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSimulation {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    latest_ledger: u32,
    #[serde(default, deserialize_with = "lenient_u64")]
    min_resource_fee: u64,
    #[serde(default)]
    cost: Option<RawCost>,
    #[serde(default)]
    transaction_data: Option<String>,
    #[serde(default)]
    results: Vec<InvocationResult>,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    state_changes: Vec<StateChange>,
    #[serde(default)]
    restore_preamble: Option<RawRestorePreamble>,
}

impl RawSimulation {
    fn into_result(self) -> Result<SimulationResult, RpcError> {
        if let Some(reason) = self.error {
            return Err(RpcError::SimulationRejected { reason });
        }
        let verdict = match self.restore_preamble {
            Some(p) => SimulationVerdict::RestoreRequired {
                min_resource_fee: p.min_resource_fee,
                transaction_data: p.transaction_data,
            },
            None => SimulationVerdict::Success,
        };
        let cost = self
            .cost
            .map(|c| ResourceCost {
                cpu_insns: c.cpu_insns,
                mem_bytes: c.mem_bytes,
            })
            .unwrap_or_default();
        Ok(SimulationResult {
            latest_ledger: self.latest_ledger,
            min_resource_fee: self.min_resource_fee,
            cost,
            transaction_data: self.transaction_data,
            results: self.results,
            events: self.events,
            state_changes: self.state_changes,
            verdict,
            simulated_at: Instant::now(),
        })
    }
}

/// Dry-runs transactions through the dispatcher.
#[derive(Debug, Clone)]
pub struct SimulationEngine {
    dispatcher: Arc<Dispatcher>,
    policy: CallPolicy,
    staleness: Duration,
}

impl SimulationEngine {
    pub fn new(dispatcher: Arc<Dispatcher>, staleness: Duration) -> Self {
        let policy = dispatcher.default_policy().clone();
        Self {
            dispatcher,
            policy,
            staleness,
        }
    }

    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    pub async fn simulate(&self, intent: &TransactionIntent) -> Result<SimulationResult, RpcError> {
        let req = self
            .dispatcher
            .request(methods::SIMULATE_TRANSACTION, intent.params());
        let resp = self.dispatcher.send(req, &self.policy).await?;
        let raw: RawSimulation = serde_json::from_value(resp.result)?;
        let result = raw.into_result()?;
        tracing::debug!(
            latest_ledger = result.latest_ledger,
            min_resource_fee = result.min_resource_fee,
            cpu_insns = result.cost.cpu_insns,
            restore = !result.succeeded(),
            "simulated transaction"
        );
        Ok(result)
    }

    /// Refuse a result older than the staleness bound.
    pub fn ensure_fresh(&self, result: &SimulationResult) -> Result<(), RpcError> {
        let age = result.age();
        if age > self.staleness {
            return Err(RpcError::StaleSimulation {
                age_ms: age.as_millis() as u64,
                limit_ms: self.staleness.as_millis() as u64,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{BearerToken, Endpoint};
    use crate::error::ErrorKind;
    use crate::policy::CircuitBreakerConfig;
    use crate::pool::{PoolConfig, TransportPool};
    use crate::request::{JsonRpcRequest, JsonRpcResponse};
    use crate::transport::{Connection, Connector};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Replies to every call with a fixed result and records the params.
    struct FixedReply {
        result: Value,
        seen: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Connection for FixedReply {
        async fn send(
            &self,
            req: &JsonRpcRequest,
            _auth: Option<&BearerToken>,
        ) -> Result<JsonRpcResponse, RpcError> {
            self.seen.lock().push(req.params.clone());
            Ok(JsonRpcResponse::success(
                req.id.as_number().unwrap_or(0),
                self.result.clone(),
            ))
        }
    }

    struct FixedConnector(Value, Arc<Mutex<Vec<Value>>>);

    #[async_trait]
    impl Connector for FixedConnector {
        async fn connect(
            &self,
            _ep: &Endpoint,
            _auth: Option<&BearerToken>,
        ) -> Result<Arc<dyn Connection>, RpcError> {
            Ok(Arc::new(FixedReply {
                result: self.0.clone(),
                seen: Arc::clone(&self.1),
            }))
        }
    }

    fn engine(result: Value) -> (Arc<Mutex<Vec<Value>>>, SimulationEngine) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool = Arc::new(TransportPool::new(
            Arc::new(FixedConnector(result, Arc::clone(&seen))),
            PoolConfig::default(),
        ));
        let dispatcher = Dispatcher::new(
            vec![Endpoint::new("https://soroban-testnet.stellar.org")],
            pool,
            &CircuitBreakerConfig::default(),
            CallPolicy::default(),
        )
        .unwrap();
        (seen, SimulationEngine::new(Arc::new(dispatcher), Duration::from_secs(30)))
    }

    #[tokio::test(start_paused = true)]
    async fn parses_successful_simulation() {
        let (seen, engine) = engine(json!({
            "latestLedger": 51234,
            "minResourceFee": "58181",
            "cost": { "cpuInsns": "1240100", "memBytes": 2086 },
            "transactionData": "AAAAAAAAAAI=",
            "results": [{ "xdr": "AAAAAwAAAAE=", "auth": [] }],
            "events": ["AAAAAQAAAAAAAAAB"],
            "stateChanges": [{ "type": "updated", "key": "AAAABg==", "before": "AA==", "after": "AQ==" }]
        }));
        let intent = TransactionIntent::new("AAAAAgAAAAA=").with_instruction_leeway(50_000);
        let result = engine.simulate(&intent).await.unwrap();

        assert!(result.succeeded());
        assert_eq!(result.latest_ledger, 51234);
        assert_eq!(result.min_resource_fee, 58181);
        assert_eq!(result.cost, ResourceCost { cpu_insns: 1_240_100, mem_bytes: 2086 });
        assert_eq!(result.state_changes[0].kind, StateChangeKind::Updated);
        assert_eq!(result.events.len(), 1);

        let params = seen.lock()[0].clone();
        assert_eq!(params["transaction"], "AAAAAgAAAAA=");
        assert_eq!(params["resourceConfig"]["instructionLeeway"], 50_000);
    }

    #[tokio::test(start_paused = true)]
    async fn error_field_is_a_rejection() {
        let (_, engine) = engine(json!({
            "latestLedger": 51234,
            "error": "HostError: Error(Contract, #3)"
        }));
        let err = engine.simulate(&TransactionIntent::new("AAAA")).await.unwrap_err();
        match err {
            RpcError::SimulationRejected { reason } => assert!(reason.contains("Contract, #3")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restore_preamble_sets_verdict() {
        let (_, engine) = engine(json!({
            "latestLedger": 9,
            "minResourceFee": "100",
            "restorePreamble": { "minResourceFee": "7000", "transactionData": "AAAB" }
        }));
        let result = engine.simulate(&TransactionIntent::new("AAAA")).await.unwrap();
        assert_eq!(
            result.verdict,
            SimulationVerdict::RestoreRequired {
                min_resource_fee: 7000,
                transaction_data: "AAAB".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_results_are_refused() {
        let (_, engine) = engine(json!({ "latestLedger": 1, "minResourceFee": "1" }));
        let result = engine.simulate(&TransactionIntent::new("AAAA")).await.unwrap();
        assert!(engine.ensure_fresh(&result).is_ok());

        tokio::time::advance(Duration::from_secs(31)).await;
        let err = engine.ensure_fresh(&result).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Simulation);
        assert!(!result.is_fresh(engine.staleness()));
    }
}
