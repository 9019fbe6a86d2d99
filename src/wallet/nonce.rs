use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::rpc::{RpcClient, RpcResult};

/// Where fresh nonces come from.
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn next_nonce(&self, address: Address) -> RpcResult<u64>;
}

/// Uses the node's pending transaction count.
pub struct PendingNonceSource {
    rpc: Arc<dyn RpcClient>,
}

impl PendingNonceSource {
    pub fn new(rpc: Arc<dyn RpcClient>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl NonceSource for PendingNonceSource {
    async fn next_nonce(&self, address: Address) -> RpcResult<u64> {
        self.rpc.pending_nonce(address).await
    }
}

/// Local nonce counter for one account, seeded once from a [`NonceSource`].
///
/// A tracker is never shared between accounts. Holding a [`NonceLease`]
/// excludes every other user of the tracker, so concurrent submitters for the
/// same account observe strictly increasing nonces.
pub struct NonceTracker {
    account: Address,
    source: Arc<dyn NonceSource>,
    next: Mutex<Option<u64>>,
}

impl NonceTracker {
    pub fn new(account: Address, source: Arc<dyn NonceSource>) -> Self {
        Self {
            account,
            source,
            next: Mutex::new(None),
        }
    }

    /// Locks the counter, seeding it from the source on first use.
    pub async fn lease(&self) -> RpcResult<NonceLease<'_>> {
        let mut guard = self.next.lock().await;
        if guard.is_none() {
            let seeded = self.source.next_nonce(self.account).await?;
            debug!(account = %self.account, nonce = seeded, "Seeded nonce counter");
            *guard = Some(seeded);
        }
        Ok(NonceLease { guard })
    }
}

/// Exclusive access to the next nonce of one account.
pub struct NonceLease<'a> {
    guard: MutexGuard<'a, Option<u64>>,
}

impl NonceLease<'_> {
    pub fn nonce(&self) -> u64 {
        self.guard.unwrap_or_default()
    }

    /// The nonce was consumed by a broadcast transaction.
    pub fn commit(mut self) {
        *self.guard = self.guard.map(|n| n + 1);
    }

    /// The local view is stale (the node reported the nonce as used); the
    /// next lease re-seeds from the source.
    pub fn invalidate(mut self) {
        *self.guard = None;
    }
}
