//! ledgerrpc-http — JSON-RPC over HTTP(S) for LedgerRPC.
//!
//! Plug [`HttpConnector`] into a [`LedgerClient`](ledgerrpc_core::LedgerClient)
//! builder; pooling, retries and circuit breaking are handled by the core.

pub mod client;

pub use client::{HttpConfig, HttpConnection, HttpConnector};
