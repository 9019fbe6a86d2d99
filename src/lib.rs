pub mod balance;
pub mod cancel;
pub mod contract;
pub mod error;
pub mod network;
pub mod rpc;
pub mod tokens;
pub mod types;
pub mod utils;
pub mod wallet;

pub use cancel::Interrupt;
pub use error::{Result, WalletError};
pub use network::{NetworkContext, NetworkId, NetworkProfile};
pub use types::{
    AccountHandle, BalanceSnapshot, GasPolicy, TokenDescriptor, TransactionOutcome,
    TransactionRequest, TransactionStatus, TxStatus,
};
pub use wallet::{Config, WalletManager};
