//! Native and token balance aggregation.
//!
//! Token balances are read through the network's Multicall3 contract in
//! batches of at most `max_batch_size` `balanceOf` calls. A failing sub-call
//! only marks that token as missing; it never aborts the snapshot.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use chrono::Utc;
use futures::{stream, StreamExt};
use tracing::{debug, warn};

use crate::{
    cancel::Interrupt,
    contract::{ContractHandle, ContractReader, TokenCall},
    error::{Result, WalletError},
    network::NetworkContext,
    rpc::{with_retries, RpcFault},
    types::{BalanceSnapshot, TokenBalance, TokenDescriptor, TokenFailure},
};

/// Per-token result of one batch, aligned with the batch's tokens.
type BatchResult = Vec<std::result::Result<U256, String>>;

pub struct BalanceAggregator {
    reader: Arc<ContractReader>,
    max_batch_size: usize,
    concurrency: usize,
}

impl BalanceAggregator {
    pub fn new(reader: Arc<ContractReader>, max_batch_size: usize, concurrency: usize) -> Self {
        Self {
            reader,
            max_batch_size: max_batch_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Native balance via a direct `eth_getBalance`.
    pub async fn native_balance(&self, account: Address, interrupt: &Interrupt) -> Result<U256> {
        let rpc = self.reader.rpc();
        let (result, _) = with_retries(self.reader.retry(), interrupt, "eth_getBalance", || {
            rpc.balance(account)
        })
        .await;
        result.map_err(|fault| match fault {
            RpcFault::Cancelled => WalletError::Cancelled,
            other => WalletError::Network(format!("Failed to get balance of {}: {}", account, other)),
        })
    }

    /// Single token balance via a direct `balanceOf` eth_call.
    pub async fn token_balance(
        &self,
        network: &NetworkContext,
        account: Address,
        token: &TokenDescriptor,
        interrupt: &Interrupt,
    ) -> Result<U256> {
        Self::check_network(network, token)?;
        let raw = self
            .reader
            .call_token(network, token.address, &TokenCall::BalanceOf { owner: account }, interrupt)
            .await
            .map_err(|fault| match fault {
                RpcFault::Cancelled => WalletError::Cancelled,
                other => WalletError::Network(format!(
                    "Failed to get {} balance of {}: {}",
                    token.symbol, account, other
                )),
            })?;
        ContractHandle::decode_balance(&raw).map_err(|e| WalletError::Network(e.to_string()))
    }

    /// Snapshot of the native balance plus every token in `tokens`.
    ///
    /// The returned `token_balances` has one entry per input token, in input
    /// order. Tokens whose sub-call failed carry `None` and are listed in
    /// `failures`.
    pub async fn fetch(
        &self,
        network: &NetworkContext,
        account: Address,
        tokens: &[TokenDescriptor],
        interrupt: &Interrupt,
    ) -> Result<BalanceSnapshot> {
        for token in tokens {
            Self::check_network(network, token)?;
        }

        // Resolve the multicall handle up front so a bad address fails the
        // whole call instead of every token.
        if !tokens.is_empty() {
            self.reader
                .multicall(network)
                .map_err(|e| WalletError::Configuration(e.to_string()))?;
        }

        let native_balance = self.native_balance(account, interrupt).await?;

        let batches: Vec<&[TokenDescriptor]> = tokens.chunks(self.max_batch_size).collect();
        debug!(
            account = %account,
            tokens = tokens.len(),
            batches = batches.len(),
            "Fetching token balances"
        );

        let results: Vec<Result<BatchResult>> = stream::iter(batches.iter().copied())
            .map(|batch| self.fetch_batch(network, account, batch, interrupt))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut token_balances = Vec::with_capacity(tokens.len());
        let mut failures = Vec::new();
        for (batch, result) in batches.iter().zip(results) {
            for (token, amount) in batch.iter().zip(result?) {
                match amount {
                    Ok(amount) => token_balances.push(TokenBalance {
                        token: token.clone(),
                        amount: Some(amount),
                    }),
                    Err(reason) => {
                        debug!(token = %token, %reason, "Token balance unavailable");
                        failures.push(TokenFailure {
                            token: token.address,
                            reason,
                        });
                        token_balances.push(TokenBalance {
                            token: token.clone(),
                            amount: None,
                        });
                    }
                }
            }
        }

        if !failures.is_empty() {
            warn!(
                account = %account,
                failed = failures.len(),
                total = tokens.len(),
                "Balance snapshot is partial"
            );
        }

        Ok(BalanceSnapshot {
            network: network.id(),
            account,
            native_balance,
            native_decimals: network.native_decimals(),
            token_balances,
            failures,
            taken_at: Utc::now(),
        })
    }

    /// One multicall round trip. Transient failures that survive the retry
    /// budget fail the fetch; a rejected aggregate call marks the whole batch
    /// as failed.
    async fn fetch_batch(
        &self,
        network: &NetworkContext,
        account: Address,
        batch: &[TokenDescriptor],
        interrupt: &Interrupt,
    ) -> Result<BatchResult> {
        let calls = batch
            .iter()
            .map(|token| {
                self.reader
                    .token(network, token.address)
                    .map(|handle| handle.multicall_entry(&TokenCall::BalanceOf { owner: account }))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| WalletError::Configuration(e.to_string()))?;

        match self.reader.aggregate(network, calls, interrupt).await {
            Ok(results) if results.len() == batch.len() => Ok(results
                .into_iter()
                .map(|r| {
                    if !r.success {
                        return Err("balanceOf reverted".to_string());
                    }
                    ContractHandle::decode_balance(&r.returnData).map_err(|e| e.to_string())
                })
                .collect()),
            Ok(results) => {
                let reason = format!(
                    "multicall returned {} results for {} calls",
                    results.len(),
                    batch.len()
                );
                Ok(vec![Err(reason); batch.len()])
            }
            Err(RpcFault::Rejected(reason)) => {
                warn!(%reason, size = batch.len(), "Multicall batch rejected");
                Ok(vec![Err(format!("multicall failed: {}", reason)); batch.len()])
            }
            Err(RpcFault::Cancelled) => Err(WalletError::Cancelled),
            Err(fault) => Err(WalletError::Network(fault.to_string())),
        }
    }

    fn check_network(network: &NetworkContext, token: &TokenDescriptor) -> Result<()> {
        if token.network != network.id() {
            return Err(WalletError::Validation(format!(
                "Token {} belongs to {}, not {}",
                token.address,
                token.network,
                network.id()
            )));
        }
        Ok(())
    }
}
