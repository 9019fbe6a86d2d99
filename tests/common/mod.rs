//! Scripted in-memory node shared by the integration tests.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy::{
    consensus::{Transaction, TxEnvelope},
    eips::eip2718::Decodable2718,
    primitives::{keccak256, Address, Bytes, TxHash, U256},
    rpc::types::TransactionRequest as TxRequest,
    signers::local::PrivateKeySigner,
    sol_types::SolCall,
};
use async_trait::async_trait;
use parking_lot::Mutex;

use wallet_smith::{
    contract::{IErc20, IMulticall3, MulticallResult},
    network::{NetworkId, MULTICALL3_ADDRESS},
    rpc::{ReceiptStatus, RpcClient, RpcFault, RpcResult},
    types::{AccountHandle, TokenDescriptor},
    utils::RetryPolicy,
    wallet::Config,
};

pub const GWEI: u128 = 1_000_000_000;
pub const BASE_GAS_PRICE: u128 = 5 * GWEI;

/// One unit of an 18-decimals asset.
pub fn units(whole: u64) -> U256 {
    U256::from(whole) * U256::from(10u64).pow(U256::from(18u64))
}

/// `tenths / 10` units of an 18-decimals asset.
pub fn tenths(tenths: u64) -> U256 {
    U256::from(tenths) * U256::from(10u64).pow(U256::from(17u64))
}

pub fn account() -> AccountHandle {
    AccountHandle::from_signer(PrivateKeySigner::random())
}

pub fn recipient(byte: u8) -> String {
    Address::repeat_byte(byte).to_checksum(None)
}

pub fn token(network: NetworkId, byte: u8, symbol: &str, decimals: u8) -> TokenDescriptor {
    TokenDescriptor {
        network,
        address: Address::repeat_byte(byte),
        symbol: symbol.to_string(),
        decimals,
        name: format!("{} Token", symbol),
    }
}

/// Millisecond-scale timings so retries and polling stay fast.
pub fn test_config() -> Config {
    Config {
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        confirmation_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(1),
        max_poll_interval: Duration::from_millis(5),
        ..Config::default()
    }
}

/// A raw transaction the mock received.
#[derive(Debug, Clone)]
pub struct SentTx {
    pub hash: TxHash,
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: Option<u128>,
    pub gas_limit: u64,
    pub input: Bytes,
    pub accepted: bool,
}

struct TokenMeta {
    symbol: Option<String>,
    decimals: Option<U256>,
    name: Option<String>,
}

#[derive(Default)]
struct State {
    native: HashMap<Address, U256>,
    token_balances: HashMap<(Address, Address), U256>,
    tokens: HashMap<Address, TokenMeta>,
    reverting_balance: HashSet<Address>,
    nonces: HashMap<Address, u64>,
    broadcast_script: VecDeque<RpcFault>,
    always_fail: Option<RpcFault>,
    /// Receipt polls seen so far and the target of each accepted transaction.
    known: HashMap<TxHash, (u32, Option<Address>)>,
    /// Per-target override of `confirm_after`.
    confirm_delays: HashMap<Address, u32>,
    /// Hashes in the order their receipts first showed up.
    mined: Vec<TxHash>,
    /// Account whose balances accepted transfers are taken from.
    debit_from: Option<Address>,
    sent: Vec<SentTx>,
    batch_sizes: Vec<usize>,
    estimate_fails: bool,
    estimate_reverts: bool,
}

/// In-memory [`RpcClient`] answering ERC-20 and Multicall3 reads from
/// tables and recording every broadcast.
pub struct MockRpc {
    chain_id: u64,
    /// Receipt polls before a transaction shows as mined; `None` never mines.
    confirm_after: Option<u32>,
    revert_receipts: bool,
    state: Mutex<State>,
    pub broadcasts: AtomicUsize,
    pub multicalls: AtomicUsize,
    pub nonce_queries: AtomicUsize,
}

impl MockRpc {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            confirm_after: Some(1),
            revert_receipts: false,
            state: Mutex::new(State::default()),
            broadcasts: AtomicUsize::new(0),
            multicalls: AtomicUsize::new(0),
            nonce_queries: AtomicUsize::new(0),
        }
    }

    pub fn testnet() -> Self {
        Self::new(97)
    }

    pub fn with_native(self, account: Address, amount: U256) -> Self {
        self.state.lock().native.insert(account, amount);
        self
    }

    pub fn with_token(self, token: &TokenDescriptor) -> Self {
        self.state.lock().tokens.insert(
            token.address,
            TokenMeta {
                symbol: Some(token.symbol.clone()),
                decimals: Some(U256::from(token.decimals)),
                name: Some(token.name.clone()),
            },
        );
        self
    }

    /// A contract answering only the given metadata calls.
    pub fn with_raw_token(
        self,
        address: Address,
        symbol: Option<&str>,
        decimals: Option<U256>,
        name: Option<&str>,
    ) -> Self {
        self.state.lock().tokens.insert(
            address,
            TokenMeta {
                symbol: symbol.map(str::to_string),
                decimals,
                name: name.map(str::to_string),
            },
        );
        self
    }

    pub fn with_token_balance(self, token: Address, owner: Address, amount: U256) -> Self {
        self.state.lock().token_balances.insert((token, owner), amount);
        self
    }

    pub fn with_reverting_balance(self, token: Address) -> Self {
        self.state.lock().reverting_balance.insert(token);
        self
    }

    pub fn with_nonce(self, account: Address, nonce: u64) -> Self {
        self.state.lock().nonces.insert(account, nonce);
        self
    }

    pub fn confirm_after(mut self, polls: Option<u32>) -> Self {
        self.confirm_after = polls;
        self
    }

    /// Transactions sent to `to` show as mined only after `polls` receipt polls.
    pub fn confirm_after_for(self, to: Address, polls: u32) -> Self {
        self.state.lock().confirm_delays.insert(to, polls);
        self
    }

    /// Accepted broadcasts move funds out of `account`, like a mined block
    /// would, so later balance reads see the drawn-down amount.
    pub fn debiting(self, account: Address) -> Self {
        self.state.lock().debit_from = Some(account);
        self
    }

    pub fn native_of(&self, account: Address) -> U256 {
        self.state.lock().native.get(&account).copied().unwrap_or_default()
    }

    pub fn mined(&self) -> Vec<TxHash> {
        self.state.lock().mined.clone()
    }

    pub fn reverting_receipts(mut self) -> Self {
        self.revert_receipts = true;
        self
    }

    pub fn failing_estimates(self) -> Self {
        self.state.lock().estimate_fails = true;
        self
    }

    pub fn reverting_estimates(self) -> Self {
        self.state.lock().estimate_reverts = true;
        self
    }

    /// Next broadcasts fail with these faults, in order.
    pub fn script_broadcasts(&self, faults: Vec<RpcFault>) {
        self.state.lock().broadcast_script.extend(faults);
    }

    pub fn fail_all_broadcasts(&self, fault: RpcFault) {
        self.state.lock().always_fail = Some(fault);
    }

    pub fn set_nonce(&self, account: Address, nonce: u64) {
        self.state.lock().nonces.insert(account, nonce);
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state.lock().sent.clone()
    }

    pub fn accepted(&self) -> Vec<SentTx> {
        self.sent().into_iter().filter(|tx| tx.accepted).collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.load(Ordering::SeqCst)
    }

    pub fn multicall_count(&self) -> usize {
        self.multicalls.load(Ordering::SeqCst)
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn erc20(&self, state: &State, target: Address, data: &[u8]) -> Option<Bytes> {
        if data.len() < 4 {
            return None;
        }
        let selector: [u8; 4] = data[..4].try_into().ok()?;
        let meta = state.tokens.get(&target);

        if selector == IErc20::balanceOfCall::SELECTOR {
            if state.reverting_balance.contains(&target) {
                return None;
            }
            let call = IErc20::balanceOfCall::abi_decode(data).ok()?;
            let amount = state
                .token_balances
                .get(&(target, call.owner))
                .copied()
                .unwrap_or_default();
            return Some(IErc20::balanceOfCall::abi_encode_returns(&amount).into());
        }
        if selector == IErc20::symbolCall::SELECTOR {
            let symbol = meta?.symbol.clone()?;
            return Some(IErc20::symbolCall::abi_encode_returns(&symbol).into());
        }
        if selector == IErc20::decimalsCall::SELECTOR {
            let decimals = meta?.decimals?;
            return Some(IErc20::decimalsCall::abi_encode_returns(&decimals).into());
        }
        if selector == IErc20::nameCall::SELECTOR {
            let name = meta?.name.clone()?;
            return Some(IErc20::nameCall::abi_encode_returns(&name).into());
        }
        None
    }
}

#[async_trait]
impl RpcClient for MockRpc {
    async fn chain_id(&self) -> RpcResult<u64> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> RpcResult<u64> {
        Ok(1_234)
    }

    async fn gas_price(&self) -> RpcResult<u128> {
        Ok(BASE_GAS_PRICE)
    }

    async fn balance(&self, address: Address) -> RpcResult<U256> {
        Ok(self.state.lock().native.get(&address).copied().unwrap_or_default())
    }

    async fn call(&self, to: Address, data: Bytes) -> RpcResult<Bytes> {
        let mut state = self.state.lock();

        if to.to_checksum(None) == MULTICALL3_ADDRESS {
            self.multicalls.fetch_add(1, Ordering::SeqCst);
            let call = IMulticall3::tryAggregateCall::abi_decode(&data)
                .map_err(|e| RpcFault::Rejected(e.to_string()))?;
            state.batch_sizes.push(call.calls.len());

            let results: Vec<MulticallResult> = call
                .calls
                .iter()
                .map(|c| match self.erc20(&state, c.target, &c.callData) {
                    Some(data) => MulticallResult {
                        success: true,
                        returnData: data,
                    },
                    None => MulticallResult {
                        success: false,
                        returnData: Bytes::new(),
                    },
                })
                .collect();
            return Ok(IMulticall3::tryAggregateCall::abi_encode_returns(&results).into());
        }

        self.erc20(&state, to, &data)
            .ok_or_else(|| RpcFault::Rejected("execution reverted".to_string()))
    }

    async fn estimate_gas(&self, tx: TxRequest) -> RpcResult<u64> {
        let state = self.state.lock();
        if state.estimate_reverts {
            return Err(RpcFault::Rejected(
                "execution reverted: BEP20: transfer amount exceeds balance".to_string(),
            ));
        }
        if state.estimate_fails {
            return Err(RpcFault::Rejected("gas required exceeds allowance".to_string()));
        }
        let has_input = tx.input.input().map(|i| !i.is_empty()).unwrap_or(false);
        Ok(if has_input { 50_000 } else { 21_000 })
    }

    async fn pending_nonce(&self, address: Address) -> RpcResult<u64> {
        self.nonce_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().nonces.get(&address).copied().unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<TxHash> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        let envelope = TxEnvelope::decode_2718(&mut raw.as_ref())
            .map_err(|e| RpcFault::Rejected(format!("invalid transaction: {}", e)))?;
        let hash = keccak256(&raw);

        let mut state = self.state.lock();
        let fault = state
            .broadcast_script
            .pop_front()
            .or_else(|| state.always_fail.clone());
        // "already known" means the node holds the transaction anyway.
        let accepted = fault.as_ref().map_or(true, |f| f.is_already_known());

        state.sent.push(SentTx {
            hash,
            nonce: envelope.nonce(),
            to: envelope.to(),
            value: envelope.value(),
            gas_price: envelope.gas_price(),
            gas_limit: envelope.gas_limit(),
            input: envelope.input().clone(),
            accepted,
        });
        if accepted && !state.known.contains_key(&hash) {
            state.known.insert(hash, (0, envelope.to()));
            if let Some(from) = state.debit_from {
                let native = state.native.entry(from).or_default();
                *native = native.saturating_sub(envelope.value());
                if let (Some(token), Ok(call)) = (
                    envelope.to(),
                    IErc20::transferCall::abi_decode(envelope.input()),
                ) {
                    let held = state.token_balances.entry((token, from)).or_default();
                    *held = held.saturating_sub(call.amount);
                }
            }
        }

        match fault {
            Some(fault) => Err(fault),
            None => Ok(hash),
        }
    }

    async fn transaction_receipt(&self, hash: TxHash) -> RpcResult<Option<ReceiptStatus>> {
        let mut state = self.state.lock();
        let Some((polls, to)) = state.known.get_mut(&hash) else {
            return Ok(None);
        };
        *polls += 1;
        let (polls, to) = (*polls, *to);
        let delay = to.and_then(|to| state.confirm_delays.get(&to).copied());

        match delay.or(self.confirm_after) {
            Some(after) if polls >= after => {
                if !state.mined.contains(&hash) {
                    state.mined.push(hash);
                }
                Ok(Some(ReceiptStatus {
                    success: !self.revert_receipts,
                    block_number: Some(1_235),
                    gas_used: 21_000,
                }))
            }
            _ => Ok(None),
        }
    }
}
