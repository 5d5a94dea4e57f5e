//! Active queue recovery polling.
//!
//! Backend restarts or connection drops can leave leased jobs orphaned with
//! no worker renewing them and no timely stalled-detection pass (the sweep
//! itself fails while the backend is down). The recovery poller keeps
//! probing the backend on its own schedule, refreshes coordinator health,
//! and heals orphans by running the same token-guarded reclaim as the
//! stalled detector. Strictly additive: an acknowledged job is never
//! completed twice.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::HealthState;
use super::stalled::reclaim_expired_sweep;
use crate::queue::QueueBackend;
use crate::store::ExecutionStore;

/// Background recovery poller.
pub struct RecoveryTask {
    pub backend: Arc<dyn QueueBackend>,
    pub store: Arc<dyn ExecutionStore>,
    /// Poll cadence. None disables recovery polling.
    pub interval: Option<Duration>,
    pub max_stalled_count: u32,
    pub batch_size: usize,
    pub health: HealthState,
}

impl RecoveryTask {
    /// Run the recovery loop.
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        let Some(interval) = self.interval else {
            info!("queue recovery polling disabled");
            return;
        };
        info!(
            interval_ms = interval.as_millis(),
            "queue recovery poller started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = std::pin::pin!(shutdown);
        let mut was_unreachable = false;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("queue recovery poller shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.backend.ping().await {
                        Ok(()) => {
                            self.health.mark_ok();
                            if was_unreachable {
                                info!("queue backend reachable again");
                                was_unreachable = false;
                            }
                            if let Err(err) = reclaim_expired_sweep(
                                self.backend.as_ref(),
                                self.store.as_ref(),
                                self.max_stalled_count,
                                self.batch_size,
                            )
                            .await
                            {
                                error!(error = %err, "recovery reclaim failed");
                            }
                        }
                        Err(err) => {
                            self.health.mark_unreachable();
                            was_unreachable = true;
                            warn!(error = %err, "queue backend unreachable; will retry");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Execution, ExecutionMode, SavePolicy};
    use crate::queue::{Job, JobState, MemoryQueue, QueueBackend};
    use crate::store::MemoryStore;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn recovery_heals_orphaned_leases_and_reports_health() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let execution = Execution::new(
            Uuid::new_v4(),
            ExecutionMode::Queue,
            SavePolicy::default(),
        );
        let job = Job::new(execution.id, execution.workflow_id);
        store.seed(execution);
        queue.enqueue(&job).await.expect("enqueue");
        // An orphaned lease: the worker vanished without renewing.
        queue
            .claim_one("w1", Duration::from_millis(0))
            .await
            .expect("claim")
            .expect("job available");

        let health = HealthState::new();
        let shutdown = CancellationToken::new();
        let task = RecoveryTask {
            backend: queue.clone(),
            store: store.clone(),
            interval: Some(Duration::from_secs(60)),
            max_stalled_count: 2,
            batch_size: 10,
            health: health.clone(),
        };
        let handle = tokio::spawn(task.run(shutdown.clone().cancelled_owned()));

        tokio::time::sleep(Duration::from_secs(61)).await;
        shutdown.cancel();
        handle.await.expect("join");

        assert!(health.is_healthy());
        assert!(health.snapshot().last_success.is_some());
        assert_eq!(
            queue.job_state(job.execution_id).await.expect("state"),
            Some(JobState::Pending)
        );
    }
}
