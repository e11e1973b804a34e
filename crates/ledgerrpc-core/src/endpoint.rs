//! Remote endpoint descriptors and the opaque caller credential.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Wire protocol spoken by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    WebSocket,
}

impl Protocol {
    /// Infer the protocol from a URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("https://") || url.starts_with("http://") {
            Some(Self::Http)
        } else if url.starts_with("wss://") || url.starts_with("ws://") {
            Some(Self::WebSocket)
        } else {
            None
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct EndpointInner {
    url: String,
    protocol: Protocol,
    region: Option<String>,
    priority: u8,
}

/// An RPC endpoint. Immutable once built and cheap to clone.
///
/// Lower `priority` values are preferred by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(Arc<EndpointInner>);

impl Endpoint {
    /// Build an endpoint with the protocol inferred from the URL scheme.
    /// Unknown schemes are treated as HTTP.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let protocol = Protocol::from_url(&url).unwrap_or(Protocol::Http);
        Self::builder(url, protocol).build()
    }

    pub fn builder(url: impl Into<String>, protocol: Protocol) -> EndpointBuilder {
        EndpointBuilder {
            url: url.into(),
            protocol,
            region: None,
            priority: 0,
        }
    }

    pub fn url(&self) -> &str {
        &self.0.url
    }

    pub fn protocol(&self) -> Protocol {
        self.0.protocol
    }

    pub fn region(&self) -> Option<&str> {
        self.0.region.as_deref()
    }

    pub fn priority(&self) -> u8 {
        self.0.priority
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.url)
    }
}

pub struct EndpointBuilder {
    url: String,
    protocol: Protocol,
    region: Option<String>,
    priority: u8,
}

impl EndpointBuilder {
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn build(self) -> Endpoint {
        Endpoint(Arc::new(EndpointInner {
            url: self.url,
            protocol: self.protocol,
            region: self.region,
            priority: self.priority,
        }))
    }
}

/// Bearer credential supplied by the session layer and attached to outbound
/// calls unmodified. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(Arc<str>);

impl BearerToken {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self(Arc::from(token.as_ref()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}
