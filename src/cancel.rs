//! Cooperative cancellation for in-flight operations.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::error::{Result, WalletError};

/// Level-triggered interrupt signal shared by every task of an operation.
///
/// Once triggered, all guarded suspension points resolve to
/// [`WalletError::Cancelled`] until [`Interrupt::rearm`] is called.
#[derive(Clone, Debug)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal every holder of this interrupt.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Clear the signal so a fresh operation can run.
    pub fn rearm(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Fails fast when already triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            return Err(WalletError::Cancelled);
        }
        Ok(())
    }

    /// Resolves once the interrupt fires.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once set.
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Races `fut` against the interrupt. The future is dropped if the
    /// interrupt wins.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.triggered() => Err(WalletError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Interruptible sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.guard(tokio::time::sleep(duration)).await
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}
