//! JSON-RPC boundary.
//!
//! Everything the core needs from a node goes through [`RpcClient`]. The
//! production implementation wraps an alloy provider; tests plug in a scripted
//! mock. Provider errors are normalised into [`RpcFault`] here so that nothing
//! above this module ever sees a raw transport error.

use std::{future::Future, sync::Arc};

use alloy::{
    network::{Ethereum, ReceiptResponse, TransactionBuilder},
    primitives::{Address, Bytes, TxHash, U256},
    providers::{Provider, ProviderBuilder},
    rpc::{json_rpc::RpcError, types::TransactionRequest},
    transports::TransportError,
};
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::{cancel::Interrupt, utils::RetryPolicy};

/// Rate-limit codes returned by common node providers.
const RATE_LIMIT_CODES: [i64; 2] = [-32005, 429];

/// A failed RPC call, classified by whether retrying can help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcFault {
    /// Connection reset, timeout, rate limiting. Safe to retry.
    #[error("transient RPC failure: {0}")]
    Transient(String),
    /// The node answered and refused the request (revert, bad nonce, underpriced...).
    #[error("RPC rejected request: {0}")]
    Rejected(String),
    /// The call was abandoned because the operation was interrupted.
    #[error("RPC call abandoned")]
    Cancelled,
}

impl RpcFault {
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcFault::Transient(_))
    }

    fn message(&self) -> &str {
        match self {
            RpcFault::Transient(msg) | RpcFault::Rejected(msg) => msg,
            RpcFault::Cancelled => "",
        }
    }

    /// The node already holds this exact signed transaction in its mempool.
    pub fn is_already_known(&self) -> bool {
        self.message().to_ascii_lowercase().contains("already known")
    }

    pub fn is_nonce_too_low(&self) -> bool {
        self.message().to_ascii_lowercase().contains("nonce too low")
    }

    /// The node executed the call and the contract reverted it.
    pub fn is_reverted(&self) -> bool {
        matches!(self, RpcFault::Rejected(_))
            && self.message().to_ascii_lowercase().contains("execution reverted")
    }
}

impl From<TransportError> for RpcFault {
    fn from(err: TransportError) -> Self {
        match &err {
            RpcError::Transport(_) | RpcError::NullResp => RpcFault::Transient(err.to_string()),
            RpcError::ErrorResp(payload) => {
                let lowered = payload.message.to_ascii_lowercase();
                if RATE_LIMIT_CODES.contains(&payload.code)
                    || lowered.contains("rate limit")
                    || lowered.contains("too many requests")
                {
                    RpcFault::Transient(payload.message.to_string())
                } else {
                    RpcFault::Rejected(payload.message.to_string())
                }
            }
            _ => RpcFault::Rejected(err.to_string()),
        }
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcFault>;

/// The subset of a transaction receipt the pipeline cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptStatus {
    pub success: bool,
    pub block_number: Option<u64>,
    pub gas_used: u64,
}

/// Node operations used by the core. Every method is a suspension point.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn chain_id(&self) -> RpcResult<u64>;

    async fn block_number(&self) -> RpcResult<u64>;

    async fn gas_price(&self) -> RpcResult<u128>;

    /// Native balance at the latest block.
    async fn balance(&self, address: Address) -> RpcResult<U256>;

    /// `eth_call` against `to` with raw calldata.
    async fn call(&self, to: Address, data: Bytes) -> RpcResult<Bytes>;

    async fn estimate_gas(&self, tx: TransactionRequest) -> RpcResult<u64>;

    /// `eth_getTransactionCount` at the pending block.
    async fn pending_nonce(&self, address: Address) -> RpcResult<u64>;

    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<TxHash>;

    async fn transaction_receipt(&self, hash: TxHash) -> RpcResult<Option<ReceiptStatus>>;
}

/// [`RpcClient`] backed by an alloy provider.
pub struct AlloyRpc {
    provider: Arc<dyn Provider<Ethereum>>,
}

impl AlloyRpc {
    pub fn new(provider: Arc<dyn Provider<Ethereum>>) -> Self {
        Self { provider }
    }

    /// Connects to `endpoint` (http, ws or ipc, whatever alloy accepts).
    pub async fn connect(endpoint: &str) -> RpcResult<Self> {
        let provider = ProviderBuilder::new().connect(endpoint).await?;
        Ok(Self::new(Arc::new(provider)))
    }
}

#[async_trait]
impl RpcClient for AlloyRpc {
    async fn chain_id(&self) -> RpcResult<u64> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn block_number(&self) -> RpcResult<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn gas_price(&self) -> RpcResult<u128> {
        Ok(self.provider.get_gas_price().await?)
    }

    async fn balance(&self, address: Address) -> RpcResult<U256> {
        Ok(self.provider.get_balance(address).await?)
    }

    async fn call(&self, to: Address, data: Bytes) -> RpcResult<Bytes> {
        let tx = TransactionRequest::default().with_to(to).with_input(data);
        Ok(self.provider.call(tx).await?)
    }

    async fn estimate_gas(&self, tx: TransactionRequest) -> RpcResult<u64> {
        Ok(self.provider.estimate_gas(tx).await?)
    }

    async fn pending_nonce(&self, address: Address) -> RpcResult<u64> {
        Ok(self.provider.get_transaction_count(address).pending().await?)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<TxHash> {
        let pending = self.provider.send_raw_transaction(&raw).await?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> RpcResult<Option<ReceiptStatus>> {
        let receipt = self.provider.get_transaction_receipt(hash).await?;
        Ok(receipt.map(|r| ReceiptStatus {
            success: r.status(),
            block_number: r.block_number(),
            gas_used: r.gas_used(),
        }))
    }
}

/// Runs `op` until it succeeds, fails with a non-transient fault, or the retry
/// budget is spent. Returns the last result and the number of attempts made.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    interrupt: &Interrupt,
    label: &str,
    mut op: F,
) -> (RpcResult<T>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RpcResult<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = match interrupt.guard(op()).await {
            Ok(result) => result,
            Err(_) => return (Err(RpcFault::Cancelled), attempts),
        };

        match result {
            Err(fault) if fault.is_transient() && attempts <= policy.max_retries => {
                let delay = policy.delay_for(attempts);
                warn!(
                    call = label,
                    attempt = attempts,
                    max_retries = policy.max_retries,
                    ?delay,
                    error = %fault,
                    "Transient RPC failure, backing off"
                );
                if interrupt.sleep(delay).await.is_err() {
                    return (Err(RpcFault::Cancelled), attempts);
                }
            }
            other => return (other, attempts),
        }
    }
}
