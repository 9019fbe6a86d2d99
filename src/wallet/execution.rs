use alloy::primitives::Address;
use futures::{future, stream, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    cancel::Interrupt,
    error::WalletError,
    network::NetworkContext,
    types::{ProgressStats, TransactionOutcome, TransactionRequest},
};

use super::{
    progress::ProgressManager,
    transaction::{SpendingBudget, SubmitFailure, TransactionManager},
    Config,
};

/// Requests of one sender, tagged with their position in the input.
struct SenderGroup {
    account: Address,
    requests: Vec<(usize, TransactionRequest)>,
}

/// Runs bulk sends: one sequential lane per sender, lanes in parallel.
pub struct ExecutionManager {
    progress: Arc<RwLock<ProgressStats>>,
    concurrency: usize,
}

impl ExecutionManager {
    /// Creates a new ExecutionManager
    pub fn new(progress: Arc<RwLock<ProgressStats>>, config: &Config) -> Self {
        Self {
            progress,
            concurrency: config.concurrency_limit.max(1),
        }
    }

    /// Sends every request and returns one outcome per request, in input order.
    ///
    /// Requests sharing a sender are submitted one after another with
    /// consecutive nonces from a shared counter; different senders proceed
    /// concurrently, bounded by the concurrency limit. A failing request
    /// never stops the others.
    pub async fn execute_bulk(
        &self,
        network: &NetworkContext,
        requests: Vec<TransactionRequest>,
        transaction_manager: &TransactionManager,
        interrupt: &Interrupt,
    ) -> Vec<TransactionOutcome> {
        let start_time = tokio::time::Instant::now();
        let progress_manager = &ProgressManager::new(self.progress.clone());
        progress_manager.reset(requests.len()).await;

        let groups = Self::group_by_sender(requests);
        info!(
            senders = groups.len(),
            concurrency = self.concurrency,
            "Starting bulk send"
        );

        let mut indexed: Vec<(usize, TransactionOutcome)> = stream::iter(groups)
            .map(|group| {
                self.run_group(network, group, transaction_manager, progress_manager, interrupt)
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        indexed.sort_by_key(|(index, _)| *index);
        let outcomes: Vec<TransactionOutcome> = indexed.into_iter().map(|(_, o)| o).collect();

        progress_manager.print_summary(&outcomes, start_time.elapsed());
        outcomes
    }

    /// Groups requests by sender, keeping first-appearance order of senders
    /// and input order within each sender.
    fn group_by_sender(requests: Vec<TransactionRequest>) -> Vec<SenderGroup> {
        let mut groups: Vec<SenderGroup> = Vec::new();
        let mut positions: HashMap<Address, usize> = HashMap::new();

        for (index, request) in requests.into_iter().enumerate() {
            let account = request.from.address;
            let slot = *positions.entry(account).or_insert_with(|| {
                groups.push(SenderGroup {
                    account,
                    requests: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].requests.push((index, request));
        }
        groups
    }

    /// Submits a sender's requests in order, then waits for all of their
    /// confirmations together.
    async fn run_group(
        &self,
        network: &NetworkContext,
        group: SenderGroup,
        transaction_manager: &TransactionManager,
        progress_manager: &ProgressManager,
        interrupt: &Interrupt,
    ) -> Vec<(usize, TransactionOutcome)> {
        let tracker = transaction_manager.nonce_tracker(group.account);
        let mut budget = SpendingBudget::default();
        let mut submitted = Vec::with_capacity(group.requests.len());

        for (index, request) in group.requests {
            if interrupt.is_triggered() {
                submitted.push((
                    index,
                    request,
                    Err(SubmitFailure::before_broadcast(WalletError::Cancelled)),
                ));
                continue;
            }

            let submission = match transaction_manager
                .prepare(network, &request, &mut budget, interrupt)
                .await
            {
                Ok(prepared) => {
                    let submission = transaction_manager
                        .submit(network, &request, &prepared, &tracker, interrupt)
                        .await;
                    if submission.is_ok() {
                        budget.commit(&request);
                    }
                    submission
                }
                Err(e) => {
                    debug!(index, error = %e, "Request rejected before broadcast");
                    Err(SubmitFailure::before_broadcast(e))
                }
            };
            submitted.push((index, request, submission));
        }

        let confirmations = submitted.into_iter().map(|(index, request, submission)| async move {
            let outcome = transaction_manager
                .finish(network, request, submission, interrupt)
                .await;
            progress_manager.update_progress(&outcome).await;
            (index, outcome)
        });

        future::join_all(confirmations).await
    }
}
