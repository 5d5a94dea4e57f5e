//! In-memory execution store for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{ExecutionStore, StoreError, StoreResult};
use crate::execution::{Execution, ExecutionFailure, ExecutionStatus};

#[derive(Clone, Default)]
pub struct MemoryStore {
    executions: Arc<Mutex<HashMap<Uuid, Execution>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an execution directly, bypassing lifecycle checks. Test helper
    /// for building histories with back-dated timestamps.
    pub fn seed(&self, execution: Execution) {
        self.executions
            .lock()
            .expect("executions poisoned")
            .insert(execution.id, execution);
    }

    fn prune_eligible(execution: &Execution) -> bool {
        execution.status.is_terminal()
            && !execution
                .save_policy
                .retains_data(execution.status, execution.mode)
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn insert(&self, execution: &Execution) -> StoreResult<()> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> StoreResult<Option<Execution>> {
        let executions = self.executions.lock().expect("executions poisoned");
        Ok(executions.get(&execution_id).cloned())
    }

    async fn mark_started(&self, execution_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::NotFound(execution_id))?;
        execution.mark_started(at)?;
        Ok(())
    }

    async fn finish(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<ExecutionFailure>,
        data: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::NotFound(execution_id))?;
        execution.finish(status, error, data, at)?;
        Ok(())
    }

    async fn count_stored(&self) -> StoreResult<u64> {
        let executions = self.executions.lock().expect("executions poisoned");
        Ok(executions
            .values()
            .filter(|execution| execution.deleted_at.is_none())
            .count() as u64)
    }

    async fn soft_delete_prunable(
        &self,
        cutoff: DateTime<Utc>,
        batch: usize,
    ) -> StoreResult<usize> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        let mut candidates: Vec<Uuid> = executions
            .values()
            .filter(|execution| {
                execution.deleted_at.is_none()
                    && execution.status.is_terminal()
                    && (execution
                        .finished_at
                        .is_some_and(|finished_at| finished_at < cutoff)
                        || Self::prune_eligible(execution))
            })
            .map(|execution| execution.id)
            .collect();
        candidates.sort();
        candidates.truncate(batch);

        let now = Utc::now();
        for id in &candidates {
            if let Some(execution) = executions.get_mut(id) {
                execution.deleted_at = Some(now);
            }
        }
        Ok(candidates.len())
    }

    async fn soft_delete_over_count(&self, max_count: u64, batch: usize) -> StoreResult<usize> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        let stored = executions
            .values()
            .filter(|execution| execution.deleted_at.is_none())
            .count() as u64;
        if stored <= max_count {
            return Ok(0);
        }
        let excess = (stored - max_count) as usize;

        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = executions
            .values()
            .filter(|execution| execution.deleted_at.is_none() && execution.status.is_terminal())
            .filter_map(|execution| {
                execution
                    .finished_at
                    .map(|finished_at| (finished_at, execution.id))
            })
            .collect();
        candidates.sort();
        candidates.truncate(std::cmp::min(batch, excess));

        let now = Utc::now();
        for (_, id) in &candidates {
            if let Some(execution) = executions.get_mut(id) {
                execution.deleted_at = Some(now);
            }
        }
        Ok(candidates.len())
    }

    async fn hard_delete_before(&self, cutoff: DateTime<Utc>, batch: usize) -> StoreResult<usize> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        let mut candidates: Vec<Uuid> = executions
            .values()
            .filter(|execution| {
                !execution.purged
                    && execution
                        .deleted_at
                        .is_some_and(|deleted_at| deleted_at < cutoff)
            })
            .map(|execution| execution.id)
            .collect();
        candidates.sort();
        candidates.truncate(batch);

        for id in &candidates {
            if let Some(execution) = executions.get_mut(id) {
                execution.data = None;
                execution.purged = true;
            }
        }
        Ok(candidates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionMode, SaveData, SavePolicy};

    fn finished_execution(hours_ago: i64) -> Execution {
        let mut execution = Execution::new(
            Uuid::new_v4(),
            ExecutionMode::Trigger,
            SavePolicy::default(),
        );
        let now = Utc::now();
        execution.status = ExecutionStatus::Success;
        execution.created_at = now - chrono::Duration::hours(hours_ago + 1);
        execution.started_at = Some(execution.created_at);
        execution.finished_at = Some(now - chrono::Duration::hours(hours_ago));
        execution.data = Some(serde_json::json!({"out": hours_ago}));
        execution
    }

    #[tokio::test]
    async fn soft_delete_skips_non_terminal_executions() {
        let store = MemoryStore::new();
        let mut running = finished_execution(500);
        running.status = ExecutionStatus::Running;
        running.finished_at = None;
        let running_id = running.id;
        store.seed(running);
        store.seed(finished_execution(500));

        let marked = store
            .soft_delete_prunable(Utc::now() - chrono::Duration::hours(336), 100)
            .await
            .expect("soft pass");
        assert_eq!(marked, 1);
        let running = store.get(running_id).await.expect("get").expect("exists");
        assert!(running.deleted_at.is_none());
    }

    #[tokio::test]
    async fn discard_policy_is_prunable_before_the_age_threshold() {
        let store = MemoryStore::new();
        let mut fresh = finished_execution(0);
        fresh.save_policy = SavePolicy {
            on_success: SaveData::None,
            ..SavePolicy::default()
        };
        store.seed(fresh);
        store.seed(finished_execution(1));

        let marked = store
            .soft_delete_prunable(Utc::now() - chrono::Duration::hours(336), 100)
            .await
            .expect("soft pass");
        assert_eq!(marked, 1, "only the discard-policy execution is eligible");
    }

    #[tokio::test]
    async fn hard_delete_respects_the_buffer_and_is_idempotent() {
        let store = MemoryStore::new();
        let mut old = finished_execution(400);
        old.deleted_at = Some(Utc::now() - chrono::Duration::hours(2));
        let old_id = old.id;
        let mut recent = finished_execution(400);
        recent.deleted_at = Some(Utc::now() - chrono::Duration::minutes(10));
        let recent_id = recent.id;
        store.seed(old);
        store.seed(recent);

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let purged = store
            .hard_delete_before(cutoff, 100)
            .await
            .expect("hard pass");
        assert_eq!(purged, 1);

        let old = store.get(old_id).await.expect("get").expect("exists");
        assert!(old.purged);
        assert!(old.payload().is_none());
        let recent = store.get(recent_id).await.expect("get").expect("exists");
        assert!(!recent.purged, "inside the buffer window");

        // Re-running the pass produces no-ops for already-purged rows.
        let purged = store
            .hard_delete_before(cutoff, 100)
            .await
            .expect("hard pass");
        assert_eq!(purged, 0);
    }

    #[tokio::test]
    async fn count_cap_sweeps_oldest_finished_first() {
        let store = MemoryStore::new();
        let oldest = finished_execution(72);
        let oldest_id = oldest.id;
        store.seed(oldest);
        store.seed(finished_execution(48));
        store.seed(finished_execution(24));

        let marked = store
            .soft_delete_over_count(2, 100)
            .await
            .expect("count cap");
        assert_eq!(marked, 1);
        let oldest = store.get(oldest_id).await.expect("get").expect("exists");
        assert!(oldest.deleted_at.is_some());
        assert_eq!(store.count_stored().await.expect("count"), 2);
    }
}
