//! ledgerrpc-ws — WebSocket transport and event subscriptions for LedgerRPC.
//!
//! - [`WsConnector`] opens multiplexed [`WsConnection`]s; pair it with
//!   `pool.multiplexed = true` so every call shares one socket per endpoint
//! - [`WsEventSource`] feeds the core event stream manager

pub mod client;
pub mod events;

pub use client::{WsConfig, WsConnection, WsConnector};
pub use events::WsEventSource;
