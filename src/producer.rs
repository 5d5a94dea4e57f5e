//! Execution creation on the producer side.
//!
//! The producer owns Execution creation: it resolves the save policy,
//! validates any per-workflow timeout against the configured ceiling
//! synchronously (rejected, never silently clamped), persists the record,
//! and in queue mode enqueues the corresponding job.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::{Config, DispatchMode};
use crate::coordinator::QueueCoordinator;
use crate::execution::{Execution, ExecutionMode, SavePolicy};
use crate::queue::{Job, QueueError};
use crate::store::{ExecutionStore, StoreError};
use crate::timeout::{TimeoutConfigError, validate_timeout};

/// Raised when an execution cannot be created.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Timeout(#[from] TimeoutConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Per-workflow overrides applied at execution creation.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkflowSettings {
    /// Per-workflow timeout in seconds; -1 disables. Must not exceed the
    /// configured ceiling.
    pub timeout_secs: Option<i64>,
    pub save_manual: Option<bool>,
}

/// Creates execution records and dispatches them.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn ExecutionStore>,
    coordinator: QueueCoordinator,
    dispatch_mode: DispatchMode,
    default_policy: SavePolicy,
    default_timeout_secs: Option<u64>,
    max_timeout_secs: u64,
}

impl Producer {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        coordinator: QueueCoordinator,
        config: &Config,
    ) -> Self {
        Self {
            store,
            coordinator,
            dispatch_mode: config.dispatch_mode,
            default_policy: SavePolicy {
                on_error: config.executions.save_on_error,
                on_success: config.executions.save_on_success,
                save_progress: config.executions.save_progress,
                save_manual: config.executions.save_manual,
            },
            default_timeout_secs: config
                .executions
                .default_timeout
                .map(|timeout| timeout.as_secs()),
            max_timeout_secs: config.executions.max_timeout_secs,
        }
    }

    /// Create an execution and, in queue mode, its job.
    pub async fn launch(
        &self,
        workflow_id: Uuid,
        mode: ExecutionMode,
        settings: WorkflowSettings,
    ) -> Result<Execution, LaunchError> {
        let timeout_secs = match settings.timeout_secs {
            Some(requested) => {
                validate_timeout(requested, self.max_timeout_secs)?.map(|value| value.as_secs())
            }
            None => self.default_timeout_secs,
        };

        let mut policy = self.default_policy;
        if let Some(save_manual) = settings.save_manual {
            policy.save_manual = save_manual;
        }

        let mut execution = Execution::new(workflow_id, mode, policy);
        execution.timeout_secs = timeout_secs;
        self.store.insert(&execution).await?;

        if self.dispatch_mode == DispatchMode::Queue {
            let job = Job::new(execution.id, workflow_id);
            self.coordinator.enqueue(&job).await?;
        }

        info!(
            execution_id = %execution.id,
            workflow_id = %workflow_id,
            mode = %mode,
            "execution created"
        );
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorSettings;
    use crate::queue::{JobState, MemoryQueue, QueueBackend};
    use crate::store::MemoryStore;

    fn producer(queue: Arc<MemoryQueue>, store: Arc<MemoryStore>) -> Producer {
        let config = Config::test_config("postgres://unused");
        let coordinator =
            QueueCoordinator::new(queue, CoordinatorSettings::from(&config.queue));
        Producer::new(store, coordinator, &config)
    }

    #[tokio::test]
    async fn launch_persists_and_enqueues() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let producer = producer(queue.clone(), store.clone());

        let execution = producer
            .launch(
                Uuid::new_v4(),
                ExecutionMode::Trigger,
                WorkflowSettings::default(),
            )
            .await
            .expect("launch");

        assert!(
            store
                .get(execution.id)
                .await
                .expect("get")
                .is_some()
        );
        assert_eq!(
            queue.job_state(execution.id).await.expect("state"),
            Some(JobState::Pending)
        );
    }

    #[tokio::test]
    async fn oversized_workflow_timeout_is_rejected() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let producer = producer(queue.clone(), store.clone());

        let err = producer
            .launch(
                Uuid::new_v4(),
                ExecutionMode::Trigger,
                WorkflowSettings {
                    timeout_secs: Some(7200),
                    ..WorkflowSettings::default()
                },
            )
            .await
            .expect_err("timeout above the ceiling must be rejected");
        assert!(matches!(
            err,
            LaunchError::Timeout(TimeoutConfigError::ExceedsMax { .. })
        ));
        // Rejected synchronously: nothing was persisted or enqueued.
        assert_eq!(store.count_stored().await.expect("count"), 0);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn per_workflow_timeout_is_applied() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let producer = producer(queue, store);

        let execution = producer
            .launch(
                Uuid::new_v4(),
                ExecutionMode::Queue,
                WorkflowSettings {
                    timeout_secs: Some(120),
                    ..WorkflowSettings::default()
                },
            )
            .await
            .expect("launch");
        assert_eq!(execution.timeout_secs, Some(120));

        let disabled = producer
            .launch(
                Uuid::new_v4(),
                ExecutionMode::Queue,
                WorkflowSettings {
                    timeout_secs: Some(-1),
                    ..WorkflowSettings::default()
                },
            )
            .await
            .expect("launch");
        assert_eq!(disabled.timeout_secs, None);
    }
}
