use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use alloy::primitives::Address;
use parking_lot::RwLock;
use tracing::debug;

use crate::{
    error::{Result, WalletError},
    network::{NetworkContext, NetworkId},
};

use super::{AbiKind, ContractHandle};

#[derive(Default)]
struct Entries {
    /// Network the cached handles belong to. A lookup for any other network
    /// discards everything.
    network: Option<NetworkId>,
    handles: HashMap<(NetworkId, Address), Arc<ContractHandle>>,
}

/// Memoizes contract handles per `(network, address)` for one network session.
///
/// Reads take a shared lock; construction happens under the write lock so a
/// handle is built at most once per key.
#[derive(Default)]
pub struct ContractCache {
    entries: RwLock<Entries>,
    constructed: AtomicUsize,
}

impl ContractCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached handle for `address`, constructing it on first use.
    ///
    /// Fails with [`WalletError::Configuration`] if the address is already
    /// cached under a different ABI.
    pub fn get_handle(
        &self,
        network: &NetworkContext,
        address: Address,
        kind: AbiKind,
    ) -> Result<Arc<ContractHandle>> {
        let key = (network.id(), address);

        {
            let entries = self.entries.read();
            if entries.network == Some(network.id()) {
                if let Some(handle) = entries.handles.get(&key) {
                    return Self::check_kind(handle, kind);
                }
            }
        }

        let mut entries = self.entries.write();
        if entries.network != Some(network.id()) {
            if entries.network.is_some() {
                debug!(
                    from = ?entries.network,
                    to = %network.id(),
                    dropped = entries.handles.len(),
                    "Network switched, dropping contract handles"
                );
            }
            entries.handles.clear();
            entries.network = Some(network.id());
        }

        let handle = entries.handles.entry(key).or_insert_with(|| {
            self.constructed.fetch_add(1, Ordering::Relaxed);
            Arc::new(ContractHandle::new(network.id(), address, kind))
        });
        Self::check_kind(handle, kind)
    }

    fn check_kind(handle: &Arc<ContractHandle>, kind: AbiKind) -> Result<Arc<ContractHandle>> {
        if handle.kind() != kind {
            return Err(WalletError::Configuration(format!(
                "Contract {} is registered as {:?}, not {:?}",
                handle.address(),
                handle.kind(),
                kind
            )));
        }
        Ok(handle.clone())
    }

    /// Drops every cached handle.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write();
        entries.handles.clear();
        entries.network = None;
    }

    /// Number of handles constructed over the cache's lifetime.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
