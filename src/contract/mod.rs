//! Typed contract handles for the closed set of calls the core makes.
//!
//! Only two ABIs are supported: the ERC-20 surface (`balanceOf`, `transfer`,
//! `symbol`, `decimals`, `name`) and Multicall3 `tryAggregate`. There is no
//! open-ended "call any function" escape hatch.

pub mod cache;

use std::sync::Arc;

use alloy::{
    primitives::{Address, Bytes, U256},
    sol,
    sol_types::SolCall,
};

use crate::{
    cancel::Interrupt,
    network::{NetworkContext, NetworkId},
    rpc::{with_retries, RpcClient, RpcFault, RpcResult},
    utils::RetryPolicy,
};

pub use cache::ContractCache;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct MulticallCall {
        address target;
        bytes callData;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct MulticallResult {
        bool success;
        bytes returnData;
    }

    interface IMulticall3 {
        function tryAggregate(bool requireSuccess, MulticallCall[] calldata calls)
            external
            payable
            returns (MulticallResult[] memory returnData);
    }

    // `decimals` is declared wide so out-of-range values can be detected
    // instead of silently truncated.
    interface IErc20 {
        function name() external view returns (string);
        function symbol() external view returns (string);
        function decimals() external view returns (uint256);
        function balanceOf(address owner) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

/// Which ABI a handle speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiKind {
    Erc20,
    Multicall3,
}

/// The supported ERC-20 calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenCall {
    BalanceOf { owner: Address },
    Transfer { to: Address, amount: U256 },
    Symbol,
    Decimals,
    Name,
}

impl TokenCall {
    pub fn name(&self) -> &'static str {
        match self {
            TokenCall::BalanceOf { .. } => "balanceOf",
            TokenCall::Transfer { .. } => "transfer",
            TokenCall::Symbol => "symbol",
            TokenCall::Decimals => "decimals",
            TokenCall::Name => "name",
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            TokenCall::BalanceOf { owner } => IErc20::balanceOfCall { owner: *owner }.abi_encode(),
            TokenCall::Transfer { to, amount } => IErc20::transferCall {
                to: *to,
                amount: *amount,
            }
            .abi_encode(),
            TokenCall::Symbol => IErc20::symbolCall {}.abi_encode(),
            TokenCall::Decimals => IErc20::decimalsCall {}.abi_encode(),
            TokenCall::Name => IErc20::nameCall {}.abi_encode(),
        }
    }
}

/// Malformed or unexpected return data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode {call} return data: {reason}")]
pub struct DecodeError {
    pub call: &'static str,
    pub reason: String,
}

impl DecodeError {
    fn new(call: &'static str, reason: impl ToString) -> Self {
        Self {
            call,
            reason: reason.to_string(),
        }
    }
}

/// A contract bound to one address on one network.
#[derive(Debug, PartialEq, Eq)]
pub struct ContractHandle {
    network: NetworkId,
    address: Address,
    kind: AbiKind,
}

impl ContractHandle {
    pub(crate) fn new(network: NetworkId, address: Address, kind: AbiKind) -> Self {
        Self {
            network,
            address,
            kind,
        }
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn kind(&self) -> AbiKind {
        self.kind
    }

    /// Calldata for an ERC-20 call on this contract.
    pub fn calldata(&self, call: &TokenCall) -> Bytes {
        debug_assert_eq!(self.kind, AbiKind::Erc20);
        call.encode().into()
    }

    /// The `(target, calldata)` pair for use inside a multicall batch.
    pub fn multicall_entry(&self, call: &TokenCall) -> MulticallCall {
        MulticallCall {
            target: self.address,
            callData: self.calldata(call),
        }
    }

    /// Calldata for `tryAggregate(false, calls)` on a Multicall3 contract.
    pub fn try_aggregate(&self, calls: Vec<MulticallCall>) -> Bytes {
        debug_assert_eq!(self.kind, AbiKind::Multicall3);
        IMulticall3::tryAggregateCall {
            requireSuccess: false,
            calls,
        }
        .abi_encode()
        .into()
    }

    pub fn decode_aggregate(&self, data: &[u8]) -> Result<Vec<MulticallResult>, DecodeError> {
        IMulticall3::tryAggregateCall::abi_decode_returns(data)
            .map_err(|e| DecodeError::new("tryAggregate", e))
    }

    pub fn decode_balance(data: &[u8]) -> Result<U256, DecodeError> {
        IErc20::balanceOfCall::abi_decode_returns(data).map_err(|e| DecodeError::new("balanceOf", e))
    }

    pub fn decode_symbol(data: &[u8]) -> Result<String, DecodeError> {
        IErc20::symbolCall::abi_decode_returns(data).map_err(|e| DecodeError::new("symbol", e))
    }

    pub fn decode_name(data: &[u8]) -> Result<String, DecodeError> {
        IErc20::nameCall::abi_decode_returns(data).map_err(|e| DecodeError::new("name", e))
    }

    /// Decodes `decimals()`, rejecting values outside `0..=255`.
    pub fn decode_decimals(data: &[u8]) -> Result<u8, DecodeError> {
        let raw = IErc20::decimalsCall::abi_decode_returns(data)
            .map_err(|e| DecodeError::new("decimals", e))?;
        u8::try_from(raw).map_err(|_| DecodeError::new("decimals", format!("{} is out of range", raw)))
    }
}

/// Issues read calls through cached handles with transient-retry.
pub struct ContractReader {
    rpc: Arc<dyn RpcClient>,
    cache: Arc<ContractCache>,
    retry: RetryPolicy,
}

impl ContractReader {
    pub fn new(rpc: Arc<dyn RpcClient>, cache: Arc<ContractCache>, retry: RetryPolicy) -> Self {
        Self { rpc, cache, retry }
    }

    pub fn rpc(&self) -> &Arc<dyn RpcClient> {
        &self.rpc
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Handle for an ERC-20 contract on the current network.
    pub fn token(&self, network: &NetworkContext, address: Address) -> RpcResult<Arc<ContractHandle>> {
        self.cache
            .get_handle(network, address, AbiKind::Erc20)
            .map_err(|e| RpcFault::Rejected(e.to_string()))
    }

    /// Handle for the network's multicall contract.
    pub fn multicall(&self, network: &NetworkContext) -> RpcResult<Arc<ContractHandle>> {
        self.cache
            .get_handle(network, network.multicall_address(), AbiKind::Multicall3)
            .map_err(|e| RpcFault::Rejected(e.to_string()))
    }

    /// Executes one ERC-20 read call and returns the raw return data.
    pub async fn call_token(
        &self,
        network: &NetworkContext,
        token: Address,
        call: &TokenCall,
        interrupt: &Interrupt,
    ) -> RpcResult<Bytes> {
        let handle = self.token(network, token)?;
        let data = handle.calldata(call);
        let (result, _) = with_retries(&self.retry, interrupt, call.name(), || {
            self.rpc.call(handle.address(), data.clone())
        })
        .await;
        result
    }

    /// Executes one `tryAggregate` round trip.
    pub async fn aggregate(
        &self,
        network: &NetworkContext,
        calls: Vec<MulticallCall>,
        interrupt: &Interrupt,
    ) -> RpcResult<Vec<MulticallResult>> {
        let handle = self.multicall(network)?;
        let data = handle.try_aggregate(calls);
        let (result, _) = with_retries(&self.retry, interrupt, "tryAggregate", || {
            self.rpc.call(handle.address(), data.clone())
        })
        .await;
        let raw = result?;
        handle
            .decode_aggregate(&raw)
            .map_err(|e| RpcFault::Rejected(e.to_string()))
    }
}
