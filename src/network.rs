//! Per-session network selection.
//!
//! A [`NetworkContext`] is built once from a [`NetworkProfile`] and then passed
//! by reference into every balance and transaction call. There is no global
//! "current network".

use alloy::primitives::{Address, TxHash};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    error::{Result, WalletError},
    utils::parse_address,
};

/// Canonical Multicall3 deployment, identical on BSC mainnet and testnet.
pub const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkId {
    Mainnet,
    Testnet,
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkId::Mainnet => write!(f, "mainnet"),
            NetworkId::Testnet => write!(f, "testnet"),
        }
    }
}

impl std::str::FromStr for NetworkId {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(NetworkId::Mainnet),
            "testnet" => Ok(NetworkId::Testnet),
            other => Err(WalletError::Configuration(format!(
                "Unknown network '{}', expected mainnet or testnet",
                other
            ))),
        }
    }
}

/// Static configuration of one network, as supplied by the surrounding
/// application. Unvalidated until passed to [`NetworkContext::select`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub id: NetworkId,
    pub name: String,
    pub rpc_endpoint: String,
    pub chain_id: i64,
    pub multicall_address: String,
    pub native_symbol: String,
    pub native_decimals: u8,
    pub explorer_url: String,
}

impl NetworkProfile {
    pub fn bsc_mainnet() -> Self {
        Self {
            id: NetworkId::Mainnet,
            name: "BSC Mainnet".to_string(),
            rpc_endpoint: "https://bsc-dataseed.binance.org/".to_string(),
            chain_id: 56,
            multicall_address: MULTICALL3_ADDRESS.to_string(),
            native_symbol: "BNB".to_string(),
            native_decimals: 18,
            explorer_url: "https://bscscan.com".to_string(),
        }
    }

    pub fn bsc_testnet() -> Self {
        Self {
            id: NetworkId::Testnet,
            name: "BSC Testnet".to_string(),
            rpc_endpoint: "https://data-seed-prebsc-1-s1.binance.org:8545/".to_string(),
            chain_id: 97,
            multicall_address: MULTICALL3_ADDRESS.to_string(),
            native_symbol: "BNB".to_string(),
            native_decimals: 18,
            explorer_url: "https://testnet.bscscan.com".to_string(),
        }
    }

    /// Preset for the given network id.
    pub fn preset(id: NetworkId) -> Self {
        match id {
            NetworkId::Mainnet => Self::bsc_mainnet(),
            NetworkId::Testnet => Self::bsc_testnet(),
        }
    }
}

/// A validated, immutable network selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    profile: NetworkProfile,
    chain_id: u64,
    multicall: Address,
}

impl NetworkContext {
    /// Validates `profile` and freezes it for the session.
    ///
    /// Fails with [`WalletError::Configuration`] when the chain id is not
    /// positive or the multicall address is not a valid checksum address.
    pub fn select(profile: NetworkProfile) -> Result<Self> {
        if profile.chain_id <= 0 {
            return Err(WalletError::Configuration(format!(
                "Chain id must be positive, got {} for {}",
                profile.chain_id, profile.name
            )));
        }

        let multicall = parse_address(&profile.multicall_address).map_err(|e| {
            WalletError::Configuration(format!("Invalid multicall address: {}", e))
        })?;

        Ok(Self {
            chain_id: profile.chain_id as u64,
            multicall,
            profile,
        })
    }

    pub fn id(&self) -> NetworkId {
        self.profile.id
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn multicall_address(&self) -> Address {
        self.multicall
    }

    pub fn native_symbol(&self) -> &str {
        &self.profile.native_symbol
    }

    pub fn native_decimals(&self) -> u8 {
        self.profile.native_decimals
    }

    pub fn profile(&self) -> &NetworkProfile {
        &self.profile
    }

    /// Block explorer link for a transaction.
    pub fn explorer_tx_url(&self, hash: &TxHash) -> String {
        format!("{}/tx/{}", self.profile.explorer_url.trim_end_matches('/'), hash)
    }
}
