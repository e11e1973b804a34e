//! ledgerrpc-networks — pre-configured profiles for Stellar networks.
//!
//! Each [`Network`] knows its passphrase and, where a public one exists, its
//! Soroban RPC URL. [`profiles`] turns a network into a tuned
//! [`ClientConfig`](ledgerrpc_core::ClientConfig).
//!
//! # Quick start
//! ```rust,no_run
//! use ledgerrpc_networks::{profiles, Network};
//!
//! # fn main() -> Result<(), ledgerrpc_core::RpcError> {
//! let config = profiles::hosted(Network::Testnet)?;
//! assert_eq!(config.endpoints.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod network;
pub mod profiles;

pub use network::Network;

use std::collections::HashMap;

use ledgerrpc_core::request::methods;

/// Relative cost of Soroban RPC methods, in rate limiter tokens.
///
/// Simulation and event scans are what public providers throttle hardest.
pub const METHOD_COSTS: &[(&str, f64)] = &[
    (methods::GET_HEALTH, 1.0),
    (methods::GET_NETWORK, 1.0),
    (methods::GET_LATEST_LEDGER, 1.0),
    (methods::GET_TRANSACTION, 2.0),
    (methods::GET_LEDGER_ENTRIES, 5.0),
    (methods::SEND_TRANSACTION, 10.0),
    (methods::GET_EVENTS, 10.0),
    (methods::SIMULATE_TRANSACTION, 20.0),
];

/// [`METHOD_COSTS`] in the shape `RateLimitSettings` expects.
pub fn method_costs() -> HashMap<String, f64> {
    METHOD_COSTS
        .iter()
        .map(|(method, cost)| (method.to_string(), *cost))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulation_is_the_most_expensive_call() {
        let costs = method_costs();
        assert_eq!(costs.len(), METHOD_COSTS.len());
        let max = costs.values().cloned().fold(0.0, f64::max);
        assert_eq!(costs[methods::SIMULATE_TRANSACTION], max);
    }
}
