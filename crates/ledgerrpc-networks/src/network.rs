//! Stellar network identities.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use ledgerrpc_core::error::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Testnet,
    Mainnet,
    Futurenet,
    /// Local quickstart container.
    Standalone,
}

impl Network {
    pub const ALL: [Network; 4] = [
        Network::Testnet,
        Network::Mainnet,
        Network::Futurenet,
        Network::Standalone,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Testnet => "testnet",
            Self::Mainnet => "mainnet",
            Self::Futurenet => "futurenet",
            Self::Standalone => "standalone",
        }
    }

    /// Passphrase that transactions for this network are signed against.
    pub fn passphrase(self) -> &'static str {
        match self {
            Self::Testnet => "Test SDF Network ; September 2015",
            Self::Mainnet => "Public Global Stellar Network ; September 2015",
            Self::Futurenet => "Test SDF Future Network ; October 2022",
            Self::Standalone => "Standalone Network ; February 2017",
        }
    }

    /// Public Soroban RPC URL. Mainnet has no SDF-hosted endpoint; bring
    /// your own provider.
    pub fn rpc_url(self) -> Option<&'static str> {
        match self {
            Self::Testnet => Some("https://soroban-testnet.stellar.org"),
            Self::Mainnet => None,
            Self::Futurenet => Some("https://rpc-futurenet.stellar.org"),
            Self::Standalone => Some("http://localhost:8000/soroban/rpc"),
        }
    }

    /// Account funding service, on networks that have one.
    pub fn friendbot_url(self) -> Option<&'static str> {
        match self {
            Self::Testnet => Some("https://friendbot.stellar.org"),
            Self::Mainnet => None,
            Self::Futurenet => Some("https://friendbot-futurenet.stellar.org"),
            Self::Standalone => Some("http://localhost:8000/friendbot"),
        }
    }

    /// Identify a network from the passphrase a node reports in `getNetwork`.
    pub fn from_passphrase(passphrase: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.passphrase() == passphrase)
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "testnet" | "test" => Ok(Self::Testnet),
            "mainnet" | "public" | "pubnet" => Ok(Self::Mainnet),
            "futurenet" => Ok(Self::Futurenet),
            "standalone" | "local" => Ok(Self::Standalone),
            other => Err(RpcError::Config(format!("unknown network: {other}"))),
        }
    }
}
