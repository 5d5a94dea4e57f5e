//! Background retention pruner.
//!
//! Two-phase deletion bounds stored execution history by age and by count:
//! a soft pass marks eligible finished executions deleted (payload
//! untouched), and a hard pass later purges payloads once a safety buffer
//! has elapsed, protecting executions a user may still be inspecting.
//! Deletes run in bounded batches; an interrupted pass resumes at the next
//! scheduled tick since every operation is idempotent.

use chrono::Utc;
use tracing::{debug, error, info};

use crate::config::PruneConfig;
use crate::store::{ExecutionStore, StoreResult};

/// Background retention pruner task.
pub struct PrunerTask<S> {
    pub store: S,
    pub config: PruneConfig,
}

impl<S> PrunerTask<S>
where
    S: ExecutionStore + Clone + Send + Sync + 'static,
{
    /// Run the pruner loop. Soft and hard passes tick independently.
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        if !self.config.enabled {
            info!("execution pruning disabled");
            return;
        }
        info!(
            max_age_hours = self.config.max_age.as_secs() / 3600,
            hard_delete_buffer_hours = self.config.hard_delete_buffer.as_secs() / 3600,
            soft_interval_secs = self.config.soft_interval.as_secs(),
            hard_interval_secs = self.config.hard_interval.as_secs(),
            max_count = self.config.max_count,
            batch_size = self.config.batch_size,
            "retention pruner started"
        );

        let mut shutdown = std::pin::pin!(shutdown);

        // Independent timers; the first pass waits one full period.
        let start = tokio::time::Instant::now();
        let mut soft_tick =
            tokio::time::interval_at(start + self.config.soft_interval, self.config.soft_interval);
        soft_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut hard_tick =
            tokio::time::interval_at(start + self.config.hard_interval, self.config.hard_interval);
        hard_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("retention pruner shutting down");
                    break;
                }
                _ = soft_tick.tick() => {
                    if let Err(err) = self.soft_pass().await {
                        error!(error = %err, "soft-delete pass failed");
                    }
                }
                _ = hard_tick.tick() => {
                    if let Err(err) = self.hard_pass().await {
                        error!(error = %err, "hard-delete pass failed");
                    }
                }
            }
        }
    }

    /// Mark prunable executions deleted, then enforce the count cap.
    pub async fn soft_pass(&self) -> StoreResult<usize> {
        let retention = chrono::Duration::from_std(self.config.max_age)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - retention;

        let mut marked_total = 0usize;
        loop {
            let marked = self
                .store
                .soft_delete_prunable(cutoff, self.config.batch_size)
                .await?;
            marked_total += marked;
            if marked < self.config.batch_size {
                break;
            }
            debug!(
                marked,
                batch_size = self.config.batch_size,
                "soft-delete batch filled; continuing immediately"
            );
        }

        if self.config.max_count > 0 {
            loop {
                let marked = self
                    .store
                    .soft_delete_over_count(self.config.max_count, self.config.batch_size)
                    .await?;
                marked_total += marked;
                if marked < self.config.batch_size {
                    break;
                }
                debug!(
                    marked,
                    max_count = self.config.max_count,
                    "count-cap batch filled; continuing immediately"
                );
            }
        }

        if marked_total > 0 {
            info!(marked_total, "soft-deleted prunable executions");
        }
        Ok(marked_total)
    }

    /// Purge payloads of executions soft-deleted before the buffer window.
    pub async fn hard_pass(&self) -> StoreResult<usize> {
        let buffer = chrono::Duration::from_std(self.config.hard_delete_buffer)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - buffer;

        let mut purged_total = 0usize;
        loop {
            let purged = self
                .store
                .hard_delete_before(cutoff, self.config.batch_size)
                .await?;
            purged_total += purged;
            if purged < self.config.batch_size {
                break;
            }
            debug!(
                purged,
                batch_size = self.config.batch_size,
                "hard-delete batch filled; continuing immediately"
            );
        }

        if purged_total > 0 {
            info!(purged_total, "purged soft-deleted execution payloads");
        }
        Ok(purged_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Execution, ExecutionMode, ExecutionStatus, SavePolicy};
    use crate::store::MemoryStore;
    use std::time::Duration;
    use uuid::Uuid;

    fn prune_config() -> PruneConfig {
        PruneConfig {
            enabled: true,
            max_age: Duration::from_secs(336 * 3600),
            hard_delete_buffer: Duration::from_secs(3600),
            soft_interval: Duration::from_secs(3600),
            hard_interval: Duration::from_secs(900),
            max_count: 0,
            batch_size: 2,
        }
    }

    fn finished_hours_ago(hours: i64) -> Execution {
        let mut execution = Execution::new(
            Uuid::new_v4(),
            ExecutionMode::Trigger,
            SavePolicy::default(),
        );
        let now = Utc::now();
        execution.status = ExecutionStatus::Success;
        execution.created_at = now - chrono::Duration::hours(hours + 1);
        execution.started_at = Some(execution.created_at);
        execution.finished_at = Some(now - chrono::Duration::hours(hours));
        execution.data = Some(serde_json::json!({"out": hours}));
        execution
    }

    #[tokio::test]
    async fn old_execution_is_soft_then_hard_deleted() {
        // finished 400h ago with a 336h max age and a 1h buffer: the next
        // soft pass marks it, and once the buffer elapses the hard pass
        // purges it.
        let store = MemoryStore::new();
        let execution = finished_hours_ago(400);
        let id = execution.id;
        store.seed(execution);

        let task = PrunerTask {
            store: store.clone(),
            config: prune_config(),
        };

        let marked = task.soft_pass().await.expect("soft pass");
        assert_eq!(marked, 1);
        let stored = store.get(id).await.expect("get").expect("exists");
        assert!(stored.deleted_at.is_some());
        assert!(!stored.purged, "payload untouched until the hard pass");

        // Inside the buffer window nothing is purged yet.
        let purged = task.hard_pass().await.expect("hard pass");
        assert_eq!(purged, 0);

        // Simulate the buffer elapsing.
        let mut stored = store.get(id).await.expect("get").expect("exists");
        stored.deleted_at = Some(Utc::now() - chrono::Duration::hours(2));
        store.seed(stored);

        let purged = task.hard_pass().await.expect("hard pass");
        assert_eq!(purged, 1);
        let stored = store.get(id).await.expect("get").expect("exists");
        assert!(stored.purged);
        assert!(stored.payload().is_none());

        // Repeated passes are no-ops.
        assert_eq!(task.hard_pass().await.expect("hard pass"), 0);
    }

    #[tokio::test]
    async fn recent_execution_survives_the_soft_pass() {
        let store = MemoryStore::new();
        let execution = finished_hours_ago(10);
        let id = execution.id;
        store.seed(execution);

        let task = PrunerTask {
            store: store.clone(),
            config: prune_config(),
        };
        assert_eq!(task.soft_pass().await.expect("soft pass"), 0);
        let stored = store.get(id).await.expect("get").expect("exists");
        assert!(stored.deleted_at.is_none());
    }

    #[tokio::test]
    async fn soft_pass_drains_past_the_batch_size() {
        let store = MemoryStore::new();
        for _ in 0..5 {
            store.seed(finished_hours_ago(400));
        }

        let task = PrunerTask {
            store: store.clone(),
            config: prune_config(),
        };
        // batch_size = 2, so draining 5 executions takes three batches
        // within a single pass.
        assert_eq!(task.soft_pass().await.expect("soft pass"), 5);
        assert_eq!(store.count_stored().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn count_cap_converges_to_the_cap() {
        let store = MemoryStore::new();
        for hours in 1..=6 {
            store.seed(finished_hours_ago(hours));
        }

        let task = PrunerTask {
            store: store.clone(),
            config: PruneConfig {
                max_count: 3,
                ..prune_config()
            },
        };
        task.soft_pass().await.expect("soft pass");
        assert_eq!(store.count_stored().await.expect("count"), 3);
    }
}
