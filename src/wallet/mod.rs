pub mod execution;
pub mod nonce;
pub mod progress;
pub mod transaction;

use alloy::primitives::{Address, TxHash, U256};
use futures::{stream, StreamExt};
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

use crate::{
    balance::BalanceAggregator,
    cancel::Interrupt,
    contract::{ContractCache, ContractReader},
    error::{Result, WalletError},
    network::{NetworkContext, NetworkProfile},
    rpc::{with_retries, AlloyRpc, RpcClient, RpcFault},
    tokens::TokenRegistry,
    types::{
        AccountHandle, BalanceSnapshot, GasPolicy, NetworkStatus, ProgressStats, TokenDescriptor,
        TransactionOutcome, TransactionRequest, TransactionStatus, TxStatus,
    },
    utils::{parse_address, RetryPolicy},
};

use self::{
    execution::ExecutionManager,
    nonce::{NonceSource, PendingNonceSource},
    transaction::TransactionManager,
};

/// Tunables for balance reads and transaction sends.
///
/// Loading these from the environment is the embedding application's job.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound of `balanceOf` calls per multicall.
    pub max_batch_size: usize,
    /// Concurrent balance batches, bulk sender lanes and wallets.
    pub concurrency_limit: usize,
    /// Backoff for transient RPC failures.
    pub retry: RetryPolicy,
    /// Budget for observing a receipt after broadcast.
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Gas limit for token transfers whose estimation failed.
    pub default_gas_limit: u64,
    /// Percentage applied to the node's gas price, 110 meaning 1.1x.
    pub gas_price_multiplier_pct: u64,
    /// Percentage applied to gas estimates, 120 meaning +20%.
    pub gas_estimate_buffer_pct: u64,
    /// When false, `Submitted` is the final status of a send.
    pub await_confirmation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            concurrency_limit: 4,
            retry: RetryPolicy::default(),
            confirmation_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(2),
            max_poll_interval: Duration::from_secs(15),
            default_gas_limit: 100_000,
            gas_price_multiplier_pct: 110,
            gas_estimate_buffer_pct: 120,
            await_confirmation: true,
        }
    }
}

/// Components bound to one network connection.
struct Session {
    network: NetworkContext,
    rpc: Arc<dyn RpcClient>,
    reader: Arc<ContractReader>,
    balances: Arc<BalanceAggregator>,
    transactions: TransactionManager,
    execution: ExecutionManager,
}

/// Entry point for balance queries and transfers on one network at a time.
pub struct WalletManager {
    config: Config,
    cache: Arc<ContractCache>,
    tokens: TokenRegistry,
    nonce_source: Option<Arc<dyn NonceSource>>,
    /// Progress statistics for the current bulk send
    progress: Arc<tokio::sync::RwLock<ProgressStats>>,
    interrupt: Interrupt,
    session: RwLock<Arc<Session>>,
}

impl WalletManager {
    /// Connects to the profile's RPC endpoint.
    pub async fn connect(profile: NetworkProfile, config: Config) -> Result<Self> {
        let rpc = AlloyRpc::connect(&profile.rpc_endpoint)
            .await
            .map_err(|e| {
                WalletError::Network(format!("Failed to connect to {}: {}", profile.rpc_endpoint, e))
            })?;
        Self::with_rpc(profile, config, Arc::new(rpc), None).await
    }

    /// Builds a manager over an existing RPC client.
    ///
    /// Nonces come from `nonce_source`, or the node's pending count when
    /// `None`. Fails with [`WalletError::Configuration`] when the node serves
    /// a different chain than the profile.
    pub async fn with_rpc(
        profile: NetworkProfile,
        config: Config,
        rpc: Arc<dyn RpcClient>,
        nonce_source: Option<Arc<dyn NonceSource>>,
    ) -> Result<Self> {
        let progress = Arc::new(tokio::sync::RwLock::new(ProgressStats::new(0)));
        let cache = Arc::new(ContractCache::new());
        let interrupt = Interrupt::new();

        let network = NetworkContext::select(profile)?;
        Self::verify_chain_id(&network, &rpc, &config.retry, &interrupt).await?;
        let session = Self::open_session(
            network,
            rpc,
            &cache,
            nonce_source.clone(),
            &progress,
            &config,
        );

        Ok(Self {
            config,
            cache,
            tokens: TokenRegistry::new(),
            nonce_source,
            progress,
            interrupt,
            session: RwLock::new(Arc::new(session)),
        })
    }

    fn open_session(
        network: NetworkContext,
        rpc: Arc<dyn RpcClient>,
        cache: &Arc<ContractCache>,
        nonce_source: Option<Arc<dyn NonceSource>>,
        progress: &Arc<tokio::sync::RwLock<ProgressStats>>,
        config: &Config,
    ) -> Session {
        let reader = Arc::new(ContractReader::new(
            rpc.clone(),
            cache.clone(),
            config.retry.clone(),
        ));
        let balances = Arc::new(BalanceAggregator::new(
            reader.clone(),
            config.max_batch_size,
            config.concurrency_limit,
        ));
        let nonces =
            nonce_source.unwrap_or_else(|| Arc::new(PendingNonceSource::new(rpc.clone())));
        let transactions = TransactionManager::new(
            rpc.clone(),
            reader.clone(),
            balances.clone(),
            nonces,
            config.clone(),
        );
        let execution = ExecutionManager::new(progress.clone(), config);

        info!(
            network = %network.id(),
            chain_id = network.chain_id(),
            multicall = %network.multicall_address(),
            "Network session opened"
        );

        Session {
            network,
            rpc,
            reader,
            balances,
            transactions,
            execution,
        }
    }

    async fn verify_chain_id(
        network: &NetworkContext,
        rpc: &Arc<dyn RpcClient>,
        retry: &RetryPolicy,
        interrupt: &Interrupt,
    ) -> Result<()> {
        let (chain_id, _) = with_retries(retry, interrupt, "eth_chainId", || rpc.chain_id()).await;
        let chain_id = chain_id.map_err(|fault| match fault {
            RpcFault::Cancelled => WalletError::Cancelled,
            other => WalletError::Network(format!("Failed to get chain id: {}", other)),
        })?;

        if chain_id != network.chain_id() {
            return Err(WalletError::Configuration(format!(
                "RPC serves chain {} but {} expects {}",
                chain_id,
                network.id(),
                network.chain_id()
            )));
        }
        Ok(())
    }

    fn session(&self) -> Arc<Session> {
        self.session.read().clone()
    }

    /// Moves the manager to another network. Every cached contract handle is
    /// dropped.
    pub async fn switch_network(
        &self,
        profile: NetworkProfile,
        rpc: Arc<dyn RpcClient>,
    ) -> Result<()> {
        let network = NetworkContext::select(profile)?;
        Self::verify_chain_id(&network, &rpc, &self.config.retry, &self.interrupt).await?;

        self.cache.invalidate_all();
        let session = Self::open_session(
            network,
            rpc,
            &self.cache,
            self.nonce_source.clone(),
            &self.progress,
            &self.config,
        );
        *self.session.write() = Arc::new(session);
        Ok(())
    }

    pub fn context(&self) -> NetworkContext {
        self.session().network.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn contract_cache(&self) -> &Arc<ContractCache> {
        &self.cache
    }

    pub fn tokens(&self) -> &TokenRegistry {
        &self.tokens
    }

    /// Replaces the token list of the current network.
    pub fn load_tokens(&self, tokens: Vec<TokenDescriptor>) {
        self.tokens.load(self.session().network.id(), tokens);
    }

    /// Signal observed by every running operation. Trigger it to stop
    /// building further work; call [`Interrupt::rearm`] before reuse.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub async fn progress(&self) -> ProgressStats {
        self.progress.read().await.clone()
    }

    /// Current block number and gas price.
    pub async fn network_status(&self) -> Result<NetworkStatus> {
        let session = self.session();
        let retry = &self.config.retry;
        let lift = |what: &str, fault: RpcFault| match fault {
            RpcFault::Cancelled => WalletError::Cancelled,
            other => WalletError::Network(format!("Failed to get {}: {}", what, other)),
        };

        let (block_number, _) = with_retries(retry, &self.interrupt, "eth_blockNumber", || {
            session.rpc.block_number()
        })
        .await;
        let block_number = block_number.map_err(|f| lift("block number", f))?;

        let (gas_price, _) = with_retries(retry, &self.interrupt, "eth_gasPrice", || {
            session.rpc.gas_price()
        })
        .await;
        let gas_price = gas_price.map_err(|f| lift("gas price", f))?;

        Ok(NetworkStatus {
            chain_id: session.network.chain_id(),
            block_number,
            gas_price,
        })
    }

    /// Looks up the receipt of `hash`, e.g. to follow up on a `TimedOut`
    /// send.
    pub async fn transaction_status(&self, hash: TxHash) -> Result<TransactionStatus> {
        let session = self.session();
        let (receipt, _) = with_retries(
            &self.config.retry,
            &self.interrupt,
            "eth_getTransactionReceipt",
            || session.rpc.transaction_receipt(hash),
        )
        .await;
        let receipt = receipt.map_err(|fault| match fault {
            RpcFault::Cancelled => WalletError::Cancelled,
            other => WalletError::Network(format!("Failed to get receipt of {}: {}", hash, other)),
        })?;

        let status = match receipt {
            None => TransactionStatus {
                hash,
                status: TxStatus::Submitted,
                block_number: None,
                gas_used: None,
            },
            Some(receipt) => TransactionStatus {
                hash,
                status: if receipt.success {
                    TxStatus::Confirmed
                } else {
                    TxStatus::Failed
                },
                block_number: receipt.block_number,
                gas_used: Some(receipt.gas_used),
            },
        };
        debug!(hash = %hash, status = ?status.status, block = ?status.block_number, "Transaction status");
        Ok(status)
    }

    /// Verifies a candidate token contract and adds it to the registry.
    pub async fn add_token(&self, address: &str) -> Result<TokenDescriptor> {
        let address = parse_address(address)?;
        let session = self.session();
        let token = self
            .tokens
            .verify(&session.network, &session.reader, address, &self.interrupt)
            .await?;
        self.tokens.upsert(token.clone());
        Ok(token)
    }

    /// Verifies a candidate token contract without registering it.
    pub async fn verify_token(&self, address: &str) -> Result<TokenDescriptor> {
        let address = parse_address(address)?;
        let session = self.session();
        self.tokens
            .verify(&session.network, &session.reader, address, &self.interrupt)
            .await
    }

    /// Snapshot over every registered token of the current network.
    pub async fn get_balances(&self, account: Address) -> Result<BalanceSnapshot> {
        let tokens = self.tokens.list(self.session().network.id());
        self.get_balances_for(account, &tokens).await
    }

    /// Snapshot over an explicit token list.
    pub async fn get_balances_for(
        &self,
        account: Address,
        tokens: &[TokenDescriptor],
    ) -> Result<BalanceSnapshot> {
        let session = self.session();
        session
            .balances
            .fetch(&session.network, account, tokens, &self.interrupt)
            .await
    }

    /// Snapshots for many accounts, one result per account in input order.
    pub async fn get_all_balances(&self, accounts: &[Address]) -> Vec<Result<BalanceSnapshot>> {
        let session = self.session();
        let tokens = self.tokens.list(session.network.id());
        let tokens = &tokens;
        let session = &session;

        stream::iter(accounts.iter().copied())
            .map(|account| async move {
                session
                    .balances
                    .fetch(&session.network, account, tokens, &self.interrupt)
                    .await
            })
            .buffered(self.config.concurrency_limit.max(1))
            .collect()
            .await
    }

    pub async fn send_transaction(&self, request: TransactionRequest) -> TransactionOutcome {
        let session = self.session();
        session
            .transactions
            .send(&session.network, request, &self.interrupt)
            .await
    }

    /// Sends `requests` and returns their outcomes in input order.
    pub async fn send_bulk(&self, requests: Vec<TransactionRequest>) -> Vec<TransactionOutcome> {
        let session = self.session();
        session
            .execution
            .execute_bulk(&session.network, requests, &session.transactions, &self.interrupt)
            .await
    }

    /// Sends the same amount of the same asset from `from` to every recipient.
    pub async fn send_to_all(
        &self,
        from: &AccountHandle,
        recipients: &[String],
        amount: U256,
        token: Option<TokenDescriptor>,
        gas: GasPolicy,
    ) -> Vec<TransactionOutcome> {
        let requests = recipients
            .iter()
            .map(|to| match &token {
                Some(token) => TransactionRequest::token(from.clone(), to.clone(), amount, token.clone()),
                None => TransactionRequest::native(from.clone(), to.clone(), amount),
            }
            .with_gas(gas.clone()))
            .collect();
        self.send_bulk(requests).await
    }

    /// Replaces the pending transaction at `nonce` with a zero-value
    /// self-transfer priced above it.
    pub async fn cancel_pending(
        &self,
        account: &AccountHandle,
        nonce: u64,
        previous_gas_price: Option<u128>,
    ) -> TransactionOutcome {
        let session = self.session();
        session
            .transactions
            .cancel_pending(&session.network, account, nonce, previous_gas_price, &self.interrupt)
            .await
    }
}
