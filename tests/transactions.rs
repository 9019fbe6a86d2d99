mod common;

use std::sync::Arc;

use alloy::primitives::{Address, TxHash, U256};
use common::*;
use alloy::sol_types::SolCall;
use wallet_smith::{
    contract::IErc20,
    network::{NetworkId, NetworkProfile},
    rpc::RpcFault,
    types::{GasPolicy, TransactionRequest, TxStatus},
    wallet::{Config, WalletManager},
    WalletError,
};

async fn manager(rpc: Arc<MockRpc>, config: Config) -> WalletManager {
    WalletManager::with_rpc(NetworkProfile::bsc_testnet(), config, rpc, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_testnet_native_send_confirms() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, tenths(15))
        .confirm_after(Some(2))
        .into_arc();
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager
        .send_transaction(TransactionRequest::native(sender.clone(), recipient(0xaa), units(1)))
        .await;

    assert_eq!(outcome.status, TxStatus::Confirmed, "{:?}", outcome.error);
    assert!(outcome.tx_hash.is_some());
    assert_eq!(outcome.block_number, Some(1_235));
    assert_eq!(outcome.gas_used, Some(21_000));
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.submitted_at.is_some());

    let sent = rpc.accepted();
    assert_eq!(sent.len(), 1);
    assert_eq!(Some(sent[0].hash), outcome.tx_hash);
    assert_eq!(sent[0].to, Some(Address::repeat_byte(0xaa)));
    assert_eq!(sent[0].value, units(1));
    // 110% of the node's price, estimate plus 20%.
    assert_eq!(sent[0].gas_price, Some(BASE_GAS_PRICE * 110 / 100));
    assert_eq!(sent[0].gas_limit, 25_200);
}

#[tokio::test]
async fn test_submitted_is_final_without_confirmation() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(2))
        .confirm_after(None)
        .into_arc();
    let manager = manager(
        rpc.clone(),
        Config {
            await_confirmation: false,
            ..test_config()
        },
    )
    .await;

    let outcome = manager
        .send_transaction(TransactionRequest::native(sender, recipient(0x01), units(1)))
        .await;
    assert_eq!(outcome.status, TxStatus::Submitted);
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn test_insufficient_balance_never_broadcasts() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(1))
        .into_arc();
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager
        .send_transaction(TransactionRequest::native(sender.clone(), recipient(0xbb), units(2)))
        .await;

    assert_eq!(outcome.status, TxStatus::Failed);
    assert_eq!(
        outcome.error,
        Some(WalletError::InsufficientBalance {
            account: sender.address,
            needed: units(2),
            available: units(1),
        })
    );
    assert_eq!(outcome.attempts, 0);
    assert_eq!(rpc.broadcast_count(), 0);
}

#[tokio::test]
async fn test_invalid_requests_fail_validation() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(5))
        .into_arc();
    let manager = manager(rpc.clone(), test_config()).await;

    // EIP-55 example address with one letter's case flipped.
    let bad_checksum = "0x5aaeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
    for request in [
        TransactionRequest::native(sender.clone(), "not an address", units(1)),
        TransactionRequest::native(sender.clone(), bad_checksum, units(1)),
        TransactionRequest::native(sender.clone(), recipient(0x02), U256::ZERO),
    ] {
        let outcome = manager.send_transaction(request).await;
        assert_eq!(outcome.status, TxStatus::Failed);
        assert!(
            matches!(outcome.error, Some(WalletError::Validation(_))),
            "{:?}",
            outcome.error
        );
    }
    assert_eq!(rpc.broadcast_count(), 0);
}

#[tokio::test]
async fn test_transient_broadcast_failures_are_retried() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(3))
        .into_arc();
    rpc.script_broadcasts(vec![
        RpcFault::Transient("connection reset".to_string()),
        RpcFault::Transient("429 too many requests".to_string()),
    ]);
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager
        .send_transaction(TransactionRequest::native(sender, recipient(0xcc), units(1)))
        .await;

    assert_eq!(outcome.status, TxStatus::Confirmed, "{:?}", outcome.error);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(rpc.broadcast_count(), 3);

    // Same nonce on every attempt, price raised each time.
    let sent = rpc.sent();
    assert!(sent.iter().all(|tx| tx.nonce == sent[0].nonce));
    let prices: Vec<_> = sent.iter().map(|tx| tx.gas_price.unwrap_or_default()).collect();
    assert!(prices.windows(2).all(|w| w[0] < w[1]), "{:?}", prices);
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(3))
        .into_arc();
    rpc.fail_all_broadcasts(RpcFault::Transient("connection refused".to_string()));
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager
        .send_transaction(TransactionRequest::native(sender, recipient(0xcd), units(1)))
        .await;

    assert_eq!(outcome.status, TxStatus::Failed);
    assert!(matches!(outcome.error, Some(WalletError::TransactionFailed(_))));
    assert_eq!(outcome.attempts, 4);
    assert_eq!(rpc.broadcast_count(), 4);
}

#[tokio::test]
async fn test_rejection_is_not_retried() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(3))
        .into_arc();
    rpc.fail_all_broadcasts(RpcFault::Rejected("execution reverted".to_string()));
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager
        .send_transaction(TransactionRequest::native(sender, recipient(0xdd), units(1)))
        .await;

    assert_eq!(outcome.status, TxStatus::Failed);
    assert!(matches!(outcome.error, Some(WalletError::TransactionFailed(_))));
    assert_eq!(outcome.attempts, 1);
    assert_eq!(rpc.broadcast_count(), 1);
    assert!(outcome.tx_hash.is_none());
}

#[tokio::test]
async fn test_already_known_counts_as_submitted() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(3))
        .into_arc();
    rpc.script_broadcasts(vec![RpcFault::Rejected("already known".to_string())]);
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager
        .send_transaction(TransactionRequest::native(sender, recipient(0xde), units(1)))
        .await;

    assert_eq!(outcome.status, TxStatus::Confirmed, "{:?}", outcome.error);
    assert_eq!(outcome.tx_hash, Some(rpc.sent()[0].hash));
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test]
async fn test_reverted_receipt_is_failed() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(3))
        .reverting_receipts()
        .into_arc();
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager
        .send_transaction(TransactionRequest::native(sender, recipient(0xee), units(1)))
        .await;

    assert_eq!(outcome.status, TxStatus::Failed);
    assert!(outcome.tx_hash.is_some());
    assert!(matches!(outcome.error, Some(WalletError::TransactionFailed(_))));
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test]
async fn test_missing_receipt_times_out() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(3))
        .confirm_after(None)
        .into_arc();
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager
        .send_transaction(TransactionRequest::native(sender, recipient(0xef), units(1)))
        .await;

    assert_eq!(outcome.status, TxStatus::TimedOut);
    let hash = outcome.tx_hash.unwrap();
    assert_eq!(outcome.error, Some(WalletError::TransactionTimeout { hash }));
}

#[tokio::test]
async fn test_token_transfer_calls_contract() {
    let sender = account();
    let usdt = token(NetworkId::Testnet, 0x77, "USDT", 18);
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(1))
        .with_token(&usdt)
        .with_token_balance(usdt.address, sender.address, units(100))
        .failing_estimates()
        .into_arc();
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager
        .send_transaction(TransactionRequest::token(
            sender,
            recipient(0x12),
            units(40),
            usdt.clone(),
        ))
        .await;
    assert_eq!(outcome.status, TxStatus::Confirmed, "{:?}", outcome.error);

    let sent = rpc.accepted();
    assert_eq!(sent[0].to, Some(usdt.address));
    assert_eq!(sent[0].value, U256::ZERO);
    assert_eq!(sent[0].gas_limit, manager.config().default_gas_limit);

    let call = IErc20::transferCall::abi_decode(&sent[0].input).unwrap();
    assert_eq!(call.to, Address::repeat_byte(0x12));
    assert_eq!(call.amount, units(40));
}

#[tokio::test]
async fn test_reverting_estimate_fails_without_broadcast() {
    let sender = account();
    let usdt = token(NetworkId::Testnet, 0x79, "USDT", 18);
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(1))
        .with_token(&usdt)
        .with_token_balance(usdt.address, sender.address, units(100))
        .reverting_estimates()
        .into_arc();
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager
        .send_transaction(TransactionRequest::token(sender, recipient(0x17), units(5), usdt))
        .await;

    assert_eq!(outcome.status, TxStatus::Failed);
    assert!(matches!(outcome.error, Some(WalletError::TransactionFailed(_))));
    assert_eq!(outcome.attempts, 0);
    assert!(outcome.nonce.is_none());
    assert_eq!(rpc.broadcast_count(), 0);
}

#[tokio::test]
async fn test_token_balance_checked_before_transfer() {
    let sender = account();
    let usdt = token(NetworkId::Testnet, 0x78, "USDT", 18);
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(10))
        .with_token(&usdt)
        .with_token_balance(usdt.address, sender.address, units(1))
        .into_arc();
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager
        .send_transaction(TransactionRequest::token(sender, recipient(0x13), units(2), usdt))
        .await;
    assert!(matches!(
        outcome.error,
        Some(WalletError::InsufficientBalance { .. })
    ));
    assert_eq!(rpc.broadcast_count(), 0);
}

#[tokio::test]
async fn test_gas_policy_overrides() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(3))
        .into_arc();
    let manager = manager(rpc.clone(), test_config()).await;

    let gas = GasPolicy {
        gas_limit: Some(30_000),
        gas_price: Some(7 * GWEI),
        price_multiplier_pct: None,
    };
    let outcome = manager
        .send_transaction(TransactionRequest::native(sender, recipient(0x14), units(1)).with_gas(gas))
        .await;
    assert_eq!(outcome.status, TxStatus::Confirmed);

    let sent = rpc.accepted();
    assert_eq!(sent[0].gas_limit, 30_000);
    assert_eq!(sent[0].gas_price, Some(7 * GWEI));
}

#[tokio::test]
async fn test_single_sends_requery_nonce() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(5))
        .with_nonce(sender.address, 4)
        .into_arc();
    let manager = manager(rpc.clone(), test_config()).await;

    manager
        .send_transaction(TransactionRequest::native(sender.clone(), recipient(0x15), units(1)))
        .await;
    rpc.set_nonce(sender.address, 5);
    manager
        .send_transaction(TransactionRequest::native(sender, recipient(0x16), units(1)))
        .await;

    let nonces: Vec<_> = rpc.accepted().iter().map(|tx| tx.nonce).collect();
    assert_eq!(nonces, vec![4, 5]);
    assert_eq!(rpc.nonce_queries.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancel_pending_replaces_with_self_transfer() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(1))
        .into_arc();
    let manager = manager(rpc.clone(), test_config()).await;

    let outcome = manager.cancel_pending(&sender, 9, Some(10 * GWEI)).await;
    assert_eq!(outcome.status, TxStatus::Confirmed, "{:?}", outcome.error);
    assert_eq!(outcome.nonce, Some(9));

    let sent = rpc.accepted();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].nonce, 9);
    assert_eq!(sent[0].to, Some(sender.address));
    assert_eq!(sent[0].value, U256::ZERO);
    assert_eq!(sent[0].gas_limit, 21_000);
    assert_eq!(sent[0].gas_price, Some(12 * GWEI));

    let unknown_price = manager.cancel_pending(&sender, 10, None).await;
    assert!(unknown_price.tx_hash.is_some());
    assert_eq!(rpc.accepted()[1].gas_price, Some(BASE_GAS_PRICE * 3));
}

#[tokio::test]
async fn test_cancel_outbids_the_stuck_transaction() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(2))
        .with_nonce(sender.address, 3)
        .confirm_after(None)
        .into_arc();
    let manager = manager(
        rpc.clone(),
        Config {
            await_confirmation: false,
            ..test_config()
        },
    )
    .await;

    let stuck = manager
        .send_transaction(TransactionRequest::native(sender.clone(), recipient(0x18), units(1)))
        .await;
    assert_eq!(stuck.status, TxStatus::Submitted);
    assert_eq!(stuck.gas_price, Some(BASE_GAS_PRICE * 110 / 100));

    let replacement = manager
        .cancel_pending(&sender, stuck.nonce.unwrap(), stuck.gas_price)
        .await;
    assert_eq!(replacement.nonce, Some(3));
    // 1.2x the stuck transaction's price.
    assert_eq!(replacement.gas_price, Some(6_600_000_000));
    assert_eq!(rpc.accepted()[1].gas_price, Some(6_600_000_000));
}

#[tokio::test]
async fn test_transaction_status_follows_up_on_a_send() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(2))
        .confirm_after(Some(2))
        .into_arc();
    let manager = manager(
        rpc.clone(),
        Config {
            await_confirmation: false,
            ..test_config()
        },
    )
    .await;

    let outcome = manager
        .send_transaction(TransactionRequest::native(sender, recipient(0x19), units(1)))
        .await;
    let hash = outcome.tx_hash.unwrap();

    let pending = manager.transaction_status(hash).await.unwrap();
    assert_eq!(pending.status, TxStatus::Submitted);
    assert_eq!(pending.block_number, None);

    let mined = manager.transaction_status(hash).await.unwrap();
    assert_eq!(mined.hash, hash);
    assert_eq!(mined.status, TxStatus::Confirmed);
    assert_eq!(mined.block_number, Some(1_235));
    assert_eq!(mined.gas_used, Some(21_000));

    let unknown = manager
        .transaction_status(TxHash::repeat_byte(0xab))
        .await
        .unwrap();
    assert_eq!(unknown.status, TxStatus::Submitted);
    assert_eq!(unknown.gas_used, None);
}

#[tokio::test]
async fn test_transaction_status_reports_reverts() {
    let sender = account();
    let rpc = MockRpc::testnet()
        .with_native(sender.address, units(2))
        .reverting_receipts()
        .into_arc();
    let manager = manager(
        rpc.clone(),
        Config {
            await_confirmation: false,
            ..test_config()
        },
    )
    .await;

    let outcome = manager
        .send_transaction(TransactionRequest::native(sender, recipient(0x1a), units(1)))
        .await;
    let status = manager
        .transaction_status(outcome.tx_hash.unwrap())
        .await
        .unwrap();
    assert_eq!(status.status, TxStatus::Failed);
    assert_eq!(status.block_number, Some(1_235));
}
