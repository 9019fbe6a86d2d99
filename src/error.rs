use alloy::primitives::{Address, TxHash, U256};
use thiserror::Error;

use crate::rpc::RpcFault;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Token verification failed for {address}: {reason}")]
    TokenVerification { address: String, reason: String },

    #[error("Insufficient balance for {account}: need {needed}, have {available}")]
    InsufficientBalance {
        account: Address,
        needed: U256,
        available: U256,
    },

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Transaction {hash} not confirmed within the timeout")]
    TransactionTimeout { hash: TxHash },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl WalletError {
    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalletError::Network(_) | WalletError::TransactionTimeout { .. }
        )
    }
}

impl From<RpcFault> for WalletError {
    fn from(fault: RpcFault) -> Self {
        match fault {
            RpcFault::Transient(msg) | RpcFault::Rejected(msg) => WalletError::Network(msg),
            RpcFault::Cancelled => WalletError::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;
