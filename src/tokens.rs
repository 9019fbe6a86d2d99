//! In-memory view of the verified token list per network.
//!
//! The surrounding application owns persistence; it loads the stored list at
//! session start and saves whatever [`TokenRegistry::verify`] returns.

use std::collections::HashMap;

use alloy::primitives::Address;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::{
    cancel::Interrupt,
    contract::{ContractHandle, ContractReader, TokenCall},
    error::{Result, WalletError},
    network::{NetworkContext, NetworkId},
    rpc::RpcFault,
    types::TokenDescriptor,
};

#[derive(Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<NetworkId, Vec<TokenDescriptor>>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the token set of `network` with `tokens`.
    ///
    /// Entries for a different network or duplicate addresses are dropped.
    pub fn load(&self, network: NetworkId, tokens: Vec<TokenDescriptor>) {
        let mut accepted: Vec<TokenDescriptor> = Vec::with_capacity(tokens.len());
        for token in tokens {
            if token.network != network {
                warn!(token = %token, expected = %network, "Skipping token bound to another network");
                continue;
            }
            if accepted.iter().any(|t| t.address == token.address) {
                warn!(token = %token, "Skipping duplicate token");
                continue;
            }
            accepted.push(token);
        }
        self.tokens.write().insert(network, accepted);
    }

    /// Current token set of `network`, in load order.
    pub fn list(&self, network: NetworkId) -> Vec<TokenDescriptor> {
        self.tokens.read().get(&network).cloned().unwrap_or_default()
    }

    pub fn get(&self, network: NetworkId, address: &Address) -> Option<TokenDescriptor> {
        self.tokens
            .read()
            .get(&network)
            .and_then(|tokens| tokens.iter().find(|t| &t.address == address).cloned())
    }

    /// Inserts `token`, replacing any entry with the same address.
    pub fn upsert(&self, token: TokenDescriptor) {
        let mut tokens = self.tokens.write();
        let list = tokens.entry(token.network).or_default();
        match list.iter_mut().find(|t| t.address == token.address) {
            Some(existing) => *existing = token,
            None => list.push(token),
        }
    }

    /// Reads `symbol()`, `decimals()` and `name()` from a candidate contract.
    ///
    /// `name()` is optional and defaults to an empty string. The registry
    /// itself is not modified.
    pub async fn verify(
        &self,
        network: &NetworkContext,
        reader: &ContractReader,
        address: Address,
        interrupt: &Interrupt,
    ) -> Result<TokenDescriptor> {
        let failed = |reason: String| WalletError::TokenVerification {
            address: address.to_string(),
            reason,
        };

        let symbol_raw = reader
            .call_token(network, address, &TokenCall::Symbol, interrupt)
            .await
            .map_err(|e| Self::lift(e, &failed))?;
        let symbol = ContractHandle::decode_symbol(&symbol_raw).map_err(|e| failed(e.to_string()))?;

        let decimals_raw = reader
            .call_token(network, address, &TokenCall::Decimals, interrupt)
            .await
            .map_err(|e| Self::lift(e, &failed))?;
        let decimals =
            ContractHandle::decode_decimals(&decimals_raw).map_err(|e| failed(e.to_string()))?;

        let name = match reader
            .call_token(network, address, &TokenCall::Name, interrupt)
            .await
        {
            Ok(raw) => ContractHandle::decode_name(&raw).unwrap_or_default(),
            Err(RpcFault::Rejected(reason)) => {
                warn!(token = %address, %reason, "name() unavailable, using empty name");
                String::new()
            }
            Err(other) => return Err(other.into()),
        };

        info!(token = %address, %symbol, decimals, %name, network = %network.id(), "Token verified");

        Ok(TokenDescriptor {
            network: network.id(),
            address,
            symbol,
            decimals,
            name,
        })
    }

    /// Rejections mean the contract does not speak ERC-20; anything else is
    /// a network problem.
    fn lift(fault: RpcFault, failed: &impl Fn(String) -> WalletError) -> WalletError {
        match fault {
            RpcFault::Rejected(reason) => failed(reason),
            other => other.into(),
        }
    }
}
