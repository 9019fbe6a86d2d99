use alloy::{
    eips::eip2718::Encodable2718,
    network::{EthereumWallet, TransactionBuilder},
    primitives::{Address, Bytes, TxHash, U256},
    rpc::types::TransactionRequest as TxRequest,
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    balance::BalanceAggregator,
    cancel::Interrupt,
    contract::{ContractReader, TokenCall},
    error::{Result, WalletError},
    network::NetworkContext,
    rpc::{with_retries, RpcClient, RpcFault},
    types::{AccountHandle, GasPolicy, TransactionOutcome, TransactionRequest, TxStatus},
    utils::{apply_pct, gas_price_for_attempt, parse_address, replacement_gas_price, GAS_LIMIT},
};

use super::{
    nonce::{NonceSource, NonceTracker},
    Config,
};

/// A validated request, resolved to the on-chain call it turns into.
#[derive(Debug, Clone)]
pub struct PreparedTransfer {
    pub recipient: Address,
    /// Transaction target: the recipient for native sends, the token contract otherwise.
    pub target: Address,
    pub value: U256,
    pub input: Bytes,
    fallback_gas_limit: u64,
}

/// Funds one sender can still commit within a batch, per asset (`None` is
/// the native coin).
///
/// The balance of an asset is read once, on first use, and every accepted
/// transfer is drawn against that reading, never against a later one.
#[derive(Debug, Default)]
pub struct SpendingBudget {
    assets: HashMap<Option<Address>, Funds>,
}

#[derive(Debug, Clone, Copy)]
struct Funds {
    available: U256,
    committed: U256,
}

impl SpendingBudget {
    fn asset(request: &TransactionRequest) -> Option<Address> {
        request.token.as_ref().map(|t| t.address)
    }

    /// Records an accepted transfer against its asset.
    pub fn commit(&mut self, request: &TransactionRequest) {
        if let Some(funds) = self.assets.get_mut(&Self::asset(request)) {
            funds.committed = funds.committed.saturating_add(request.amount);
        }
    }
}

/// A transaction the node accepted.
#[derive(Debug, Clone)]
pub struct Submission {
    pub hash: TxHash,
    pub nonce: u64,
    pub gas_price: u128,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
}

/// A request that did not make it into the mempool.
#[derive(Debug, Clone)]
pub struct SubmitFailure {
    pub error: WalletError,
    pub attempts: u32,
    pub nonce: Option<u64>,
}

impl SubmitFailure {
    pub(crate) fn before_broadcast(error: WalletError) -> Self {
        Self {
            error,
            attempts: 0,
            nonce: None,
        }
    }
}

/// What polling for a receipt observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed { block_number: Option<u64>, gas_used: u64 },
    Reverted { block_number: Option<u64>, gas_used: u64 },
    TimedOut,
    Interrupted,
}

enum BroadcastError {
    Cancelled,
    Signing(String),
    NonceTooLow(String),
    Rejected(String),
    Exhausted(String),
}

/// Builds, signs, broadcasts and confirms transfers.
pub struct TransactionManager {
    rpc: Arc<dyn RpcClient>,
    reader: Arc<ContractReader>,
    balances: Arc<BalanceAggregator>,
    nonces: Arc<dyn NonceSource>,
    config: Config,
}

impl TransactionManager {
    /// Creates a new TransactionManager
    pub fn new(
        rpc: Arc<dyn RpcClient>,
        reader: Arc<ContractReader>,
        balances: Arc<BalanceAggregator>,
        nonces: Arc<dyn NonceSource>,
        config: Config,
    ) -> Self {
        Self {
            rpc,
            reader,
            balances,
            nonces,
            config,
        }
    }

    /// A fresh nonce counter for `account`.
    pub fn nonce_tracker(&self, account: Address) -> NonceTracker {
        NonceTracker::new(account, self.nonces.clone())
    }

    /// Sends a single request end to end.
    ///
    /// The nonce is taken fresh from the nonce source; nothing is cached
    /// between calls.
    pub async fn send(
        &self,
        network: &NetworkContext,
        request: TransactionRequest,
        interrupt: &Interrupt,
    ) -> TransactionOutcome {
        let mut budget = SpendingBudget::default();
        let prepared = match self.prepare(network, &request, &mut budget, interrupt).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(request = %request, error = %e, "Transaction rejected before broadcast");
                return TransactionOutcome::rejected(request, e);
            }
        };

        let tracker = self.nonce_tracker(request.from.address);
        let submission = self
            .submit(network, &request, &prepared, &tracker, interrupt)
            .await;
        self.finish(network, request, submission, interrupt).await
    }

    /// Validates `request` and checks the sender can cover it on top of
    /// what `budget` already committed. The asset's balance is queried only
    /// when `budget` has not seen it yet.
    pub async fn prepare(
        &self,
        network: &NetworkContext,
        request: &TransactionRequest,
        budget: &mut SpendingBudget,
        interrupt: &Interrupt,
    ) -> Result<PreparedTransfer> {
        interrupt.check()?;

        let recipient = parse_address(&request.to)?;
        if request.amount.is_zero() {
            return Err(WalletError::Validation(
                "Amount must be greater than zero".to_string(),
            ));
        }

        let account = request.from.address;
        let asset = SpendingBudget::asset(request);
        let funds = match budget.assets.get(&asset) {
            Some(funds) => *funds,
            None => {
                let available = match &request.token {
                    Some(token) => {
                        self.balances
                            .token_balance(network, account, token, interrupt)
                            .await?
                    }
                    None => self.balances.native_balance(account, interrupt).await?,
                };
                let funds = Funds {
                    available,
                    committed: U256::ZERO,
                };
                budget.assets.insert(asset, funds);
                funds
            }
        };

        let available = funds.available;
        let needed = funds.committed.saturating_add(request.amount);
        if available < needed {
            return Err(WalletError::InsufficientBalance {
                account,
                needed,
                available,
            });
        }

        match &request.token {
            Some(token) => {
                let handle = self
                    .reader
                    .token(network, token.address)
                    .map_err(|e| WalletError::Configuration(e.to_string()))?;
                Ok(PreparedTransfer {
                    recipient,
                    target: token.address,
                    value: U256::ZERO,
                    input: handle.calldata(&TokenCall::Transfer {
                        to: recipient,
                        amount: request.amount,
                    }),
                    fallback_gas_limit: self.config.default_gas_limit,
                })
            }
            None => Ok(PreparedTransfer {
                recipient,
                target: recipient,
                value: request.amount,
                input: Bytes::new(),
                fallback_gas_limit: GAS_LIMIT,
            }),
        }
    }

    /// Prices, signs and broadcasts a prepared transfer with the next nonce
    /// from `tracker`. The nonce is consumed only if the node accepts the
    /// transaction.
    pub async fn submit(
        &self,
        network: &NetworkContext,
        request: &TransactionRequest,
        prepared: &PreparedTransfer,
        tracker: &NonceTracker,
        interrupt: &Interrupt,
    ) -> std::result::Result<Submission, SubmitFailure> {
        let from = request.from.address;
        let template = TxRequest::default()
            .with_from(from)
            .with_to(prepared.target)
            .with_value(prepared.value)
            .with_input(prepared.input.clone())
            .with_chain_id(network.chain_id());

        let gas_limit = self
            .gas_limit(&request.gas, &template, prepared.fallback_gas_limit, interrupt)
            .await
            .map_err(SubmitFailure::before_broadcast)?;

        let (base_price, multiplier_pct) = match request.gas.gas_price {
            Some(price) => (price, 100),
            None => (
                self.gas_price(interrupt)
                    .await
                    .map_err(SubmitFailure::before_broadcast)?,
                request
                    .gas
                    .price_multiplier_pct
                    .unwrap_or(self.config.gas_price_multiplier_pct),
            ),
        };

        let lease = match interrupt.guard(tracker.lease()).await {
            Ok(Ok(lease)) => lease,
            Ok(Err(fault)) => {
                return Err(SubmitFailure::before_broadcast(WalletError::Network(
                    format!("Failed to get nonce for {}: {}", from, fault),
                )))
            }
            Err(e) => return Err(SubmitFailure::before_broadcast(e)),
        };
        let nonce = lease.nonce();

        let template = template.with_gas_limit(gas_limit).with_nonce(nonce);
        let price_for = |attempt: u32| gas_price_for_attempt(base_price, multiplier_pct, attempt);

        match self
            .broadcast(request.from.wallet(), &template, price_for, interrupt)
            .await
        {
            Ok((hash, attempts)) => {
                lease.commit();
                let gas_price = price_for(attempts);
                info!(
                    hash = %hash,
                    from = %from,
                    to = %prepared.recipient,
                    nonce,
                    gas_limit,
                    gas_price,
                    attempts,
                    explorer = %network.explorer_tx_url(&hash),
                    "Transaction submitted"
                );
                Ok(Submission {
                    hash,
                    nonce,
                    gas_price,
                    attempts,
                    submitted_at: Utc::now(),
                })
            }
            Err((err, attempts)) => {
                let error = match err {
                    BroadcastError::Cancelled => WalletError::Cancelled,
                    BroadcastError::Signing(msg) => {
                        WalletError::TransactionFailed(format!("Failed to sign transaction: {}", msg))
                    }
                    BroadcastError::NonceTooLow(msg) => {
                        lease.invalidate();
                        WalletError::TransactionFailed(format!("Nonce {} already used: {}", nonce, msg))
                    }
                    BroadcastError::Rejected(msg) => {
                        WalletError::TransactionFailed(format!("Transaction rejected: {}", msg))
                    }
                    BroadcastError::Exhausted(msg) => WalletError::TransactionFailed(format!(
                        "Broadcast failed after {} attempts: {}",
                        attempts, msg
                    )),
                };
                warn!(from = %from, nonce, attempts, error = %error, "Transaction not submitted");
                Err(SubmitFailure {
                    error,
                    attempts,
                    nonce: Some(nonce),
                })
            }
        }
    }

    /// Signs and sends `template`, re-pricing and retrying transient failures
    /// with backoff. Rejections are terminal.
    async fn broadcast(
        &self,
        wallet: &EthereumWallet,
        template: &TxRequest,
        price_for: impl Fn(u32) -> u128,
        interrupt: &Interrupt,
    ) -> std::result::Result<(TxHash, u32), (BroadcastError, u32)> {
        let retry = &self.config.retry;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let envelope = template
                .clone()
                .with_gas_price(price_for(attempts))
                .build(wallet)
                .await
                .map_err(|e| (BroadcastError::Signing(e.to_string()), attempts))?;
            let hash = *envelope.tx_hash();
            let raw: Bytes = envelope.encoded_2718().into();

            let fault = match interrupt.guard(self.rpc.send_raw_transaction(raw)).await {
                Err(_) => return Err((BroadcastError::Cancelled, attempts)),
                Ok(Ok(returned)) => return Ok((returned, attempts)),
                Ok(Err(fault)) => fault,
            };

            if fault.is_already_known() {
                info!(hash = %hash, "Transaction already known to the node");
                return Ok((hash, attempts));
            }
            if fault.is_nonce_too_low() {
                return Err((BroadcastError::NonceTooLow(fault.to_string()), attempts));
            }
            match fault {
                RpcFault::Transient(msg) if attempts <= retry.max_retries => {
                    let delay = retry.delay_for(attempts);
                    warn!(
                        attempt = attempts,
                        max_retries = retry.max_retries,
                        ?delay,
                        error = %msg,
                        "Broadcast failed, re-pricing and retrying"
                    );
                    if interrupt.sleep(delay).await.is_err() {
                        return Err((BroadcastError::Cancelled, attempts));
                    }
                }
                RpcFault::Transient(msg) => return Err((BroadcastError::Exhausted(msg), attempts)),
                RpcFault::Rejected(msg) => return Err((BroadcastError::Rejected(msg), attempts)),
                RpcFault::Cancelled => return Err((BroadcastError::Cancelled, attempts)),
            }
        }
    }

    async fn gas_limit(
        &self,
        policy: &GasPolicy,
        template: &TxRequest,
        fallback: u64,
        interrupt: &Interrupt,
    ) -> Result<u64> {
        if let Some(limit) = policy.gas_limit {
            return Ok(limit);
        }

        let (estimate, _) = with_retries(&self.config.retry, interrupt, "eth_estimateGas", || {
            self.rpc.estimate_gas(template.clone())
        })
        .await;

        match estimate {
            Ok(gas) => Ok(apply_pct(gas as u128, self.config.gas_estimate_buffer_pct) as u64),
            Err(RpcFault::Cancelled) => Err(WalletError::Cancelled),
            Err(fault) if fault.is_reverted() => Err(WalletError::TransactionFailed(format!(
                "Transfer would revert: {}",
                fault
            ))),
            Err(fault) => {
                warn!(error = %fault, fallback, "Gas estimation failed, using default gas limit");
                Ok(fallback)
            }
        }
    }

    async fn gas_price(&self, interrupt: &Interrupt) -> Result<u128> {
        let (price, _) = with_retries(&self.config.retry, interrupt, "eth_gasPrice", || {
            self.rpc.gas_price()
        })
        .await;
        price.map_err(|fault| match fault {
            RpcFault::Cancelled => WalletError::Cancelled,
            other => WalletError::Network(format!("Failed to get gas price: {}", other)),
        })
    }

    /// Polls for the receipt of `hash` with a growing interval until it shows
    /// up or the confirmation budget is spent.
    pub async fn await_confirmation(&self, hash: TxHash, interrupt: &Interrupt) -> Confirmation {
        let deadline = Instant::now() + self.config.confirmation_timeout;
        let mut interval = self.config.poll_interval;

        loop {
            match interrupt.guard(self.rpc.transaction_receipt(hash)).await {
                Err(_) => return Confirmation::Interrupted,
                Ok(Ok(Some(receipt))) if receipt.success => {
                    return Confirmation::Confirmed {
                        block_number: receipt.block_number,
                        gas_used: receipt.gas_used,
                    }
                }
                Ok(Ok(Some(receipt))) => {
                    return Confirmation::Reverted {
                        block_number: receipt.block_number,
                        gas_used: receipt.gas_used,
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(fault)) => warn!(hash = %hash, error = %fault, "Receipt poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Confirmation::TimedOut;
            }

            let wait = interval.min(deadline - now);
            if interrupt.sleep(wait).await.is_err() {
                return Confirmation::Interrupted;
            }
            interval = interval
                .mul_f32(1.5)
                .min(self.config.max_poll_interval.max(Duration::from_millis(1)));
        }
    }

    /// Turns a submission attempt into the request's final outcome, waiting
    /// for confirmation when configured to.
    pub async fn finish(
        &self,
        network: &NetworkContext,
        request: TransactionRequest,
        submission: std::result::Result<Submission, SubmitFailure>,
        interrupt: &Interrupt,
    ) -> TransactionOutcome {
        let submission = match submission {
            Ok(submission) => submission,
            Err(failure) => {
                return TransactionOutcome {
                    request,
                    status: TxStatus::Failed,
                    tx_hash: None,
                    nonce: failure.nonce,
                    block_number: None,
                    gas_price: None,
                    gas_used: None,
                    attempts: failure.attempts,
                    error: Some(failure.error),
                    submitted_at: None,
                }
            }
        };

        let mut outcome = TransactionOutcome {
            request,
            status: TxStatus::Submitted,
            tx_hash: Some(submission.hash),
            nonce: Some(submission.nonce),
            block_number: None,
            gas_price: Some(submission.gas_price),
            gas_used: None,
            attempts: submission.attempts,
            error: None,
            submitted_at: Some(submission.submitted_at),
        };

        if !self.config.await_confirmation {
            return outcome;
        }

        let started = Instant::now();
        match self.await_confirmation(submission.hash, interrupt).await {
            Confirmation::Confirmed {
                block_number,
                gas_used,
            } => {
                info!(
                    hash = %submission.hash,
                    block = ?block_number,
                    gas_used,
                    elapsed = ?started.elapsed(),
                    explorer = %network.explorer_tx_url(&submission.hash),
                    "Transaction Landed!"
                );
                outcome.status = TxStatus::Confirmed;
                outcome.block_number = block_number;
                outcome.gas_used = Some(gas_used);
            }
            Confirmation::Reverted {
                block_number,
                gas_used,
            } => {
                warn!(hash = %submission.hash, block = ?block_number, gas_used, "Transaction reverted");
                outcome.status = TxStatus::Failed;
                outcome.block_number = block_number;
                outcome.gas_used = Some(gas_used);
                outcome.error = Some(WalletError::TransactionFailed(format!(
                    "Transaction {} reverted in block {}",
                    submission.hash,
                    block_number.map(|b| b.to_string()).unwrap_or_else(|| "?".to_string())
                )));
            }
            Confirmation::TimedOut => {
                warn!(
                    hash = %submission.hash,
                    timeout = ?self.config.confirmation_timeout,
                    "Transaction submitted but not confirmed within timeout"
                );
                outcome.status = TxStatus::TimedOut;
                outcome.error = Some(WalletError::TransactionTimeout {
                    hash: submission.hash,
                });
            }
            Confirmation::Interrupted => {
                outcome.error = Some(WalletError::Cancelled);
            }
        }
        outcome
    }

    /// Replaces a stuck transaction by sending zero value to the sender
    /// itself with the same nonce and a higher gas price.
    pub async fn cancel_pending(
        &self,
        network: &NetworkContext,
        account: &AccountHandle,
        nonce: u64,
        previous_gas_price: Option<u128>,
        interrupt: &Interrupt,
    ) -> TransactionOutcome {
        let mut request = TransactionRequest::native(
            account.clone(),
            account.address.to_checksum(None),
            U256::ZERO,
        );

        let current = match self.gas_price(interrupt).await {
            Ok(price) => price,
            Err(e) => return TransactionOutcome::rejected(request, e),
        };
        let gas_price = replacement_gas_price(previous_gas_price, current);
        request.gas = GasPolicy {
            gas_limit: Some(GAS_LIMIT),
            gas_price: Some(gas_price),
            price_multiplier_pct: None,
        };

        let template = TxRequest::default()
            .with_from(account.address)
            .with_to(account.address)
            .with_value(U256::ZERO)
            .with_gas_limit(GAS_LIMIT)
            .with_nonce(nonce)
            .with_chain_id(network.chain_id());

        info!(account = %account.address, nonce, gas_price, "Attempting to cancel pending transaction");

        let price_for = |attempt: u32| gas_price_for_attempt(gas_price, 100, attempt);
        let submission = match self
            .broadcast(account.wallet(), &template, price_for, interrupt)
            .await
        {
            Ok((hash, attempts)) => Ok(Submission {
                hash,
                nonce,
                gas_price: price_for(attempts),
                attempts,
                submitted_at: Utc::now(),
            }),
            Err((err, attempts)) => Err(SubmitFailure {
                error: match err {
                    BroadcastError::Cancelled => WalletError::Cancelled,
                    BroadcastError::NonceTooLow(_) => WalletError::TransactionFailed(format!(
                        "Nonce {} is already mined, nothing to cancel",
                        nonce
                    )),
                    BroadcastError::Signing(msg)
                    | BroadcastError::Rejected(msg)
                    | BroadcastError::Exhausted(msg) => WalletError::TransactionFailed(format!(
                        "Cancellation transaction failed: {}",
                        msg
                    )),
                },
                attempts,
                nonce: Some(nonce),
            }),
        };

        self.finish(network, request, submission, interrupt).await
    }
}
