use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{info, info_span, warn};

use crate::types::{ProgressStats, TransactionOutcome, TxStatus};

/// Manages progress tracking and reporting for bulk sends
pub struct ProgressManager {
    progress: Arc<RwLock<ProgressStats>>,
}

impl ProgressManager {
    /// Creates a new ProgressManager
    pub fn new(progress: Arc<RwLock<ProgressStats>>) -> Self {
        Self { progress }
    }

    /// Starts a new run of `total` operations.
    pub async fn reset(&self, total: usize) {
        *self.progress.write().await = ProgressStats::new(total);
    }

    pub async fn snapshot(&self) -> ProgressStats {
        self.progress.read().await.clone()
    }

    /// Records one finished request and logs the current status
    pub async fn update_progress(&self, outcome: &TransactionOutcome) {
        let mut progress = self.progress.write().await;
        progress.completed_operations += 1;
        if outcome.is_success() {
            progress.successful_operations += 1;
        }

        let progress_percent = if progress.total_operations == 0 {
            100.0
        } else {
            (progress.completed_operations as f64 / progress.total_operations as f64) * 100.0
        };
        let time_remaining = progress
            .estimated_time_remaining()
            .map(|d| format!("{:.1} minutes", d.as_secs_f64() / 60.0))
            .unwrap_or_else(|| "calculating...".to_string());

        info!(
            completed = progress.completed_operations,
            total = progress.total_operations,
            progress_percent = format!("{:.1}%", progress_percent),
            success_rate = format!("{:.1}%", progress.success_rate()),
            ops_per_minute = format!("{:.1}", progress.operations_per_minute()),
            time_remaining,
            "Progress update"
        );
    }

    /// Logs the final tally of a bulk send and every failed request.
    pub fn print_summary(&self, outcomes: &[TransactionOutcome], elapsed: Duration) {
        let summary_span = info_span!("bulk_summary");
        let _guard = summary_span.enter();

        let count = |status: TxStatus| outcomes.iter().filter(|o| o.status == status).count();

        info!(
            duration = ?elapsed,
            total = outcomes.len(),
            confirmed = count(TxStatus::Confirmed),
            submitted = count(TxStatus::Submitted),
            timed_out = count(TxStatus::TimedOut),
            failed = count(TxStatus::Failed),
            "Bulk send completed"
        );

        for (index, outcome) in outcomes.iter().enumerate() {
            if outcome.status != TxStatus::Failed {
                continue;
            }
            warn!(
                index,
                request = %outcome.request,
                attempts = outcome.attempts,
                error = outcome.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "Request failed"
            );
        }
    }
}
