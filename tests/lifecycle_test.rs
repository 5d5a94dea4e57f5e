//! End-to-end lifecycle tests over the public API with in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conveyor::config::PruneConfig;
use conveyor::coordinator::{CoordinatorSettings, QueueCoordinator, StalledDetectorConfig, StalledDetectorTask};
use conveyor::execution::{Execution, ExecutionFailure, ExecutionMode, ExecutionStatus, SavePolicy};
use conveyor::pruner::PrunerTask;
use conveyor::queue::{Job, JobState, MemoryQueue, QueueBackend};
use conveyor::store::{ExecutionStore, MemoryStore};
use conveyor::worker::{RunOutcome, Worker, WorkerSettings, WorkflowRuntime};

struct EchoRuntime;

#[async_trait::async_trait]
impl WorkflowRuntime for EchoRuntime {
    async fn run(&self, execution: Execution, cancel: CancellationToken) -> RunOutcome {
        if cancel.is_cancelled() {
            return RunOutcome::canceled();
        }
        RunOutcome::success(Some(serde_json::json!({
            "workflow_id": execution.workflow_id,
        })))
    }
}

fn coordinator(queue: Arc<MemoryQueue>, lock_duration: Duration) -> QueueCoordinator {
    QueueCoordinator::new(
        queue,
        CoordinatorSettings {
            lock_duration,
            max_stalled_count: 1,
        },
    )
}

fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        poll_interval: Duration::from_millis(10),
        lock_renew_time: Duration::from_millis(50),
        concurrency: 2,
        graceful_shutdown_timeout: Duration::from_secs(1),
        default_timeout: None,
    }
}

async fn enqueue_execution(queue: &MemoryQueue, store: &MemoryStore) -> Uuid {
    let execution = Execution::new(
        Uuid::new_v4(),
        ExecutionMode::Queue,
        SavePolicy::default(),
    );
    let job = Job::new(execution.id, execution.workflow_id);
    let execution_id = execution.id;
    store.seed(execution);
    queue.enqueue(&job).await.expect("enqueue");
    execution_id
}

#[tokio::test]
async fn enqueued_execution_runs_to_success() {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());
    let execution_id = enqueue_execution(&queue, &store).await;

    let worker = Worker::new(
        "it-worker",
        coordinator(queue.clone(), Duration::from_secs(30)),
        store.clone(),
        Arc::new(EchoRuntime),
        worker_settings(),
    );
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    let mut completed = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if queue.job_state(execution_id).await.expect("state") == Some(JobState::Completed) {
            completed = true;
            break;
        }
    }
    shutdown.cancel();
    handle.await.expect("worker exits");
    assert!(completed, "job should be acked");

    let execution = store
        .get(execution_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert!(execution.payload().is_some());
}

#[tokio::test]
async fn crashed_worker_lease_is_dead_lettered() {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());
    let execution_id = enqueue_execution(&queue, &store).await;

    // A worker that claims with an immediately expiring lease and vanishes.
    queue
        .claim_one("doomed-worker", Duration::from_millis(0))
        .await
        .expect("claim")
        .expect("job available");

    let shutdown = CancellationToken::new();
    let detector = StalledDetectorTask {
        backend: queue.clone(),
        store: store.clone(),
        config: StalledDetectorConfig {
            interval: Some(Duration::from_millis(20)),
            max_stalled_count: 1,
            batch_size: 10,
        },
        health: Default::default(),
    };
    let handle = tokio::spawn(detector.run(shutdown.clone().cancelled_owned()));

    let mut dead_lettered = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if queue.job_state(execution_id).await.expect("state") == Some(JobState::DeadLetter) {
            dead_lettered = true;
            break;
        }
    }
    shutdown.cancel();
    handle.await.expect("detector exits");
    assert!(dead_lettered, "job should be dead-lettered");

    let execution = store
        .get(execution_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(execution.status, ExecutionStatus::Error);
    assert!(matches!(
        execution.error,
        Some(ExecutionFailure::StallRetriesExceeded { .. })
    ));

    // Never re-leased.
    let next = queue
        .claim_one("another-worker", Duration::from_secs(30))
        .await
        .expect("claim");
    assert!(next.is_none());
}

#[tokio::test]
async fn retention_passes_age_out_old_history() {
    let store = MemoryStore::new();
    let mut execution = Execution::new(
        Uuid::new_v4(),
        ExecutionMode::Trigger,
        SavePolicy::default(),
    );
    execution.status = ExecutionStatus::Success;
    execution.created_at = Utc::now() - chrono::Duration::hours(401);
    execution.started_at = Some(execution.created_at);
    execution.finished_at = Some(Utc::now() - chrono::Duration::hours(400));
    execution.data = Some(serde_json::json!({"out": true}));
    let execution_id = execution.id;
    store.seed(execution);

    let pruner = PrunerTask {
        store: store.clone(),
        config: PruneConfig {
            enabled: true,
            max_age: Duration::from_secs(336 * 3600),
            hard_delete_buffer: Duration::from_secs(3600),
            soft_interval: Duration::from_secs(3600),
            hard_interval: Duration::from_secs(900),
            max_count: 0,
            batch_size: 100,
        },
    };

    assert_eq!(pruner.soft_pass().await.expect("soft pass"), 1);
    let stored = store
        .get(execution_id)
        .await
        .expect("get")
        .expect("exists");
    assert!(stored.deleted_at.is_some());
    assert!(!stored.purged);

    // The hard pass respects the buffer; age the soft-delete mark past it.
    assert_eq!(pruner.hard_pass().await.expect("hard pass"), 0);
    let mut stored = store
        .get(execution_id)
        .await
        .expect("get")
        .expect("exists");
    stored.deleted_at = Some(Utc::now() - chrono::Duration::hours(2));
    store.seed(stored);

    assert_eq!(pruner.hard_pass().await.expect("hard pass"), 1);
    let stored = store
        .get(execution_id)
        .await
        .expect("get")
        .expect("exists");
    assert!(stored.purged);
    assert!(stored.payload().is_none());
}
