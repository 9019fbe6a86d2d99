//! Core type definitions for balances and transfers.
//!
//! This module contains the records exchanged with the surrounding
//! application: token metadata, account handles, balance snapshots,
//! transfer requests and their outcomes.

use alloy::{
    network::EthereumWallet,
    primitives::{utils::format_units, Address, TxHash, U256},
    signers::local::PrivateKeySigner,
};
use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, time::Instant};

use crate::{
    error::WalletError,
    network::NetworkId,
    utils::{serialize_display, serialize_display_opt},
};

/// Metadata of a verified ERC-20 token, bound to exactly one network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenDescriptor {
    pub network: NetworkId,
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
    pub name: String,
}

impl Display for TokenDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) on {}", self.symbol, self.address, self.network)
    }
}

/// An account the core can sign for. Held by the caller, never persisted.
#[derive(Clone, Serialize)]
pub struct AccountHandle {
    pub address: Address,
    #[serde(skip)]
    wallet: EthereumWallet,
}

impl AccountHandle {
    pub fn new(wallet: EthereumWallet) -> Self {
        Self {
            address: wallet.default_signer().address(),
            wallet,
        }
    }

    pub fn from_signer(signer: PrivateKeySigner) -> Self {
        Self::new(EthereumWallet::new(signer))
    }

    pub fn wallet(&self) -> &EthereumWallet {
        &self.wallet
    }
}

impl fmt::Debug for AccountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountHandle")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Caller overrides for gas. Unset fields are filled from the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GasPolicy {
    pub gas_limit: Option<u64>,
    pub gas_price: Option<u128>,
    /// Overrides the configured gas price multiplier (percent, 110 = 1.1x).
    pub price_multiplier_pct: Option<u64>,
}

/// A value transfer to submit. Native when `token` is `None`.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRequest {
    pub from: AccountHandle,
    /// Recipient as supplied by the caller; validated before submission.
    pub to: String,
    /// Amount in base units.
    #[serde(serialize_with = "serialize_display")]
    pub amount: U256,
    pub token: Option<TokenDescriptor>,
    pub gas: GasPolicy,
}

impl TransactionRequest {
    pub fn native(from: AccountHandle, to: impl Into<String>, amount: U256) -> Self {
        Self {
            from,
            to: to.into(),
            amount,
            token: None,
            gas: GasPolicy::default(),
        }
    }

    pub fn token(
        from: AccountHandle,
        to: impl Into<String>,
        amount: U256,
        token: TokenDescriptor,
    ) -> Self {
        Self {
            from,
            to: to.into(),
            amount,
            token: Some(token),
            gas: GasPolicy::default(),
        }
    }

    pub fn with_gas(mut self, gas: GasPolicy) -> Self {
        self.gas = gas;
        self
    }
}

impl Display for TransactionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(token) => write!(
                f,
                "Transfer {} {} from {} to {}",
                format_units(self.amount, token.decimals).unwrap_or_default(),
                token.symbol,
                self.from.address,
                self.to
            ),
            None => write!(
                f,
                "Transfer {} native from {} to {}",
                format_units(self.amount, "ether").unwrap_or_default(),
                self.from.address,
                self.to
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxStatus {
    /// Broadcast accepted by the node, confirmation not observed (yet).
    Submitted,
    Confirmed,
    Failed,
    /// Confirmation not observed within the budget. Advisory: the
    /// transaction may still land.
    TimedOut,
}

/// Result of one [`TransactionRequest`].
#[derive(Debug, Clone, Serialize)]
pub struct TransactionOutcome {
    pub request: TransactionRequest,
    pub status: TxStatus,
    pub tx_hash: Option<TxHash>,
    pub nonce: Option<u64>,
    pub block_number: Option<u64>,
    /// Gas price of the accepted broadcast, the floor for a replacement.
    pub gas_price: Option<u128>,
    /// Reported by the receipt once mined.
    pub gas_used: Option<u64>,
    /// Broadcast attempts made, zero when the request never reached the node.
    pub attempts: u32,
    #[serde(serialize_with = "serialize_display_opt")]
    pub error: Option<WalletError>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl TransactionOutcome {
    /// Outcome for a request that never reached the broadcast step.
    pub fn rejected(request: TransactionRequest, error: WalletError) -> Self {
        Self {
            request,
            status: TxStatus::Failed,
            tx_hash: None,
            nonce: None,
            block_number: None,
            gas_price: None,
            gas_used: None,
            attempts: 0,
            error: Some(error),
            submitted_at: None,
        }
    }

    /// Confirmed, or accepted by the node when confirmation is not awaited.
    pub fn is_success(&self) -> bool {
        matches!(self.status, TxStatus::Confirmed | TxStatus::Submitted)
    }
}

/// Chain state of a transaction looked up by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransactionStatus {
    pub hash: TxHash,
    /// `Submitted` while the node has no receipt: pending, or unknown to it.
    pub status: TxStatus,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
}

/// Balance of one token inside a snapshot. `amount` is `None` when the
/// sub-call for this token failed; see [`BalanceSnapshot::failures`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenBalance {
    pub token: TokenDescriptor,
    #[serde(serialize_with = "serialize_display_opt")]
    pub amount: Option<U256>,
}

impl TokenBalance {
    /// Human readable amount, scaled by the token's decimals.
    pub fn formatted(&self) -> Option<String> {
        self.amount
            .and_then(|amount| format_units(amount, self.token.decimals).ok())
    }
}

/// Why a token is missing from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenFailure {
    pub token: Address,
    pub reason: String,
}

/// Point-in-time balances of one account on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    pub network: NetworkId,
    pub account: Address,
    #[serde(serialize_with = "serialize_display")]
    pub native_balance: U256,
    pub native_decimals: u8,
    /// One entry per requested token, in request order.
    pub token_balances: Vec<TokenBalance>,
    pub failures: Vec<TokenFailure>,
    pub taken_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn balance_of(&self, token: &Address) -> Option<U256> {
        self.token_balances
            .iter()
            .find(|b| &b.token.address == token)
            .and_then(|b| b.amount)
    }

    /// Tokens with a known, non-zero balance.
    pub fn non_zero(&self) -> impl Iterator<Item = &TokenBalance> {
        self.token_balances
            .iter()
            .filter(|b| b.amount.is_some_and(|a| !a.is_zero()))
    }
}

/// Current chain head and gas price, used as a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    pub chain_id: u64,
    pub block_number: u64,
    pub gas_price: u128,
}

/// Statistics for a bulk send in progress.
#[derive(Debug, Clone)]
pub struct ProgressStats {
    pub total_operations: usize,
    pub completed_operations: usize,
    pub successful_operations: usize,
    pub started_at: Instant,
}

impl ProgressStats {
    pub fn new(total_operations: usize) -> Self {
        Self {
            total_operations,
            completed_operations: 0,
            successful_operations: 0,
            started_at: Instant::now(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.completed_operations == 0 {
            return 0.0;
        }
        self.successful_operations as f64 / self.completed_operations as f64 * 100.0
    }

    pub fn operations_per_minute(&self) -> f64 {
        let minutes = self.started_at.elapsed().as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        self.completed_operations as f64 / minutes
    }

    pub fn estimated_time_remaining(&self) -> Option<std::time::Duration> {
        let rate = self.operations_per_minute();
        if rate <= 0.0 || self.completed_operations >= self.total_operations {
            return None;
        }
        let remaining = (self.total_operations - self.completed_operations) as f64;
        Some(std::time::Duration::from_secs_f64(remaining / rate * 60.0))
    }
}
