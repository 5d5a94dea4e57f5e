//! Background stalled-job detection.
//!
//! A lease past its expiry means the owning worker crashed or stalled. The
//! detector sweeps such leases, returning each job to pending until its
//! stall budget runs out, then dead-letters it and marks the execution
//! failed with a distinguishable cause.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::HealthState;
use crate::execution::{ExecutionFailure, ExecutionStatus};
use crate::queue::{QueueBackend, QueueResult, ReclaimOutcome};
use crate::store::ExecutionStore;

/// Configuration for the stalled-job detector.
#[derive(Debug, Clone)]
pub struct StalledDetectorConfig {
    /// How often to sweep for expired leases. None disables the detector.
    pub interval: Option<Duration>,
    /// Max times a stalled job is re-queued before being dead-lettered.
    pub max_stalled_count: u32,
    /// Maximum expired leases reclaimed per sweep batch.
    pub batch_size: usize,
}

impl Default for StalledDetectorConfig {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_secs(30)),
            max_stalled_count: 1,
            batch_size: 100,
        }
    }
}

/// Background stalled-job detector task.
pub struct StalledDetectorTask {
    pub backend: Arc<dyn QueueBackend>,
    pub store: Arc<dyn ExecutionStore>,
    pub config: StalledDetectorConfig,
    pub health: HealthState,
}

impl StalledDetectorTask {
    /// Run the detector loop.
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        let Some(interval) = self.config.interval else {
            info!("stalled detection disabled");
            return;
        };
        info!(
            interval_ms = interval.as_millis(),
            max_stalled_count = self.config.max_stalled_count,
            batch_size = self.config.batch_size,
            "stalled detector started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("stalled detector shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match reclaim_expired_sweep(
                        self.backend.as_ref(),
                        self.store.as_ref(),
                        self.config.max_stalled_count,
                        self.config.batch_size,
                    )
                    .await
                    {
                        Ok(_) => self.health.mark_ok(),
                        Err(err) => {
                            if err.is_retryable() {
                                self.health.mark_unreachable();
                            }
                            error!(error = %err, "stalled sweep failed");
                        }
                    }
                }
            }
        }
    }
}

/// Reclaim all currently expired leases, draining in batches.
///
/// Shared with the recovery poller; reclaiming is guarded by the lease token
/// and state, so a job that was acked or re-leased in the meantime is left
/// untouched and an already-acknowledged job is never double-completed.
pub(crate) async fn reclaim_expired_sweep(
    backend: &dyn QueueBackend,
    store: &dyn ExecutionStore,
    max_stalled_count: u32,
    batch_size: usize,
) -> QueueResult<usize> {
    let mut reclaimed_total = 0usize;
    loop {
        let expired = backend.list_expired(Utc::now(), batch_size).await?;
        if expired.is_empty() {
            break;
        }
        let batch_len = expired.len();
        for lease in expired {
            match backend
                .reclaim_expired(lease.execution_id, lease.token, max_stalled_count)
                .await?
            {
                ReclaimOutcome::Requeued { stalled_count } => {
                    reclaimed_total += 1;
                    warn!(
                        execution_id = %lease.execution_id,
                        stalled_count,
                        "stalled job returned to pending"
                    );
                }
                ReclaimOutcome::DeadLettered { stalled_count } => {
                    reclaimed_total += 1;
                    warn!(
                        execution_id = %lease.execution_id,
                        stalled_count,
                        "stalled job dead-lettered"
                    );
                    mark_execution_dead_lettered(store, lease.execution_id, stalled_count).await;
                }
                ReclaimOutcome::AlreadyResolved => {
                    debug!(
                        execution_id = %lease.execution_id,
                        "expired lease resolved before reclaim"
                    );
                }
            }
        }
        if batch_len < batch_size {
            break;
        }
    }
    if reclaimed_total > 0 {
        info!(reclaimed_total, "reclaimed expired leases");
    }
    Ok(reclaimed_total)
}

async fn mark_execution_dead_lettered(
    store: &dyn ExecutionStore,
    execution_id: Uuid,
    stalled_count: u32,
) {
    let result = store
        .finish(
            execution_id,
            ExecutionStatus::Error,
            Some(ExecutionFailure::StallRetriesExceeded { stalled_count }),
            None,
            Utc::now(),
        )
        .await;
    if let Err(err) = result {
        // The execution may already be terminal if a slow worker reported
        // a result after its lease expired.
        warn!(
            execution_id = %execution_id,
            error = %err,
            "failed to mark dead-lettered execution"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Execution, ExecutionMode, SavePolicy};
    use crate::queue::{Job, JobState, MemoryQueue, QueueBackend};
    use crate::store::MemoryStore;

    async fn seeded(queue: &MemoryQueue, store: &MemoryStore) -> Job {
        let execution = Execution::new(
            Uuid::new_v4(),
            ExecutionMode::Queue,
            SavePolicy::default(),
        );
        let job = Job::new(execution.id, execution.workflow_id);
        store.seed(execution);
        queue.enqueue(&job).await.expect("enqueue");
        job
    }

    #[tokio::test]
    async fn sweep_requeues_unrenewed_leases() {
        let queue = MemoryQueue::new();
        let store = MemoryStore::new();
        let job = seeded(&queue, &store).await;
        queue
            .claim_one("w1", Duration::from_millis(0))
            .await
            .expect("claim")
            .expect("job available");

        let reclaimed = reclaim_expired_sweep(&queue, &store, 2, 10)
            .await
            .expect("sweep");
        assert_eq!(reclaimed, 1);
        assert_eq!(
            queue.job_state(job.execution_id).await.expect("state"),
            Some(JobState::Pending)
        );
    }

    #[tokio::test]
    async fn sweep_leaves_live_leases_alone() {
        let queue = MemoryQueue::new();
        let store = MemoryStore::new();
        let job = seeded(&queue, &store).await;
        queue
            .claim_one("w1", Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("job available");

        let reclaimed = reclaim_expired_sweep(&queue, &store, 1, 10)
            .await
            .expect("sweep");
        assert_eq!(reclaimed, 0);
        assert_eq!(
            queue.job_state(job.execution_id).await.expect("state"),
            Some(JobState::Leased)
        );
    }

    #[tokio::test]
    async fn exhausted_stall_budget_dead_letters_and_fails_the_execution() {
        let queue = MemoryQueue::new();
        let store = MemoryStore::new();
        let job = seeded(&queue, &store).await;
        queue
            .claim_one("w1", Duration::from_millis(0))
            .await
            .expect("claim")
            .expect("job available");

        let reclaimed = reclaim_expired_sweep(&queue, &store, 1, 10)
            .await
            .expect("sweep");
        assert_eq!(reclaimed, 1);
        assert_eq!(
            queue.job_state(job.execution_id).await.expect("state"),
            Some(JobState::DeadLetter)
        );

        let execution = store
            .get(job.execution_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert!(matches!(
            execution.error,
            Some(ExecutionFailure::StallRetriesExceeded { stalled_count: 1 })
        ));

        // Idempotent: the dead-letter state survives further sweeps and the
        // job is never leased again.
        let reclaimed = reclaim_expired_sweep(&queue, &store, 1, 10)
            .await
            .expect("sweep");
        assert_eq!(reclaimed, 0);
        let next = queue
            .claim_one("w2", Duration::from_secs(30))
            .await
            .expect("claim");
        assert!(next.is_none());
    }
}
