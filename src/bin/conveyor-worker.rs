//! Conveyor worker: pulls jobs from the shared queue and runs them.
//!
//! This binary starts the worker infrastructure:
//! - Connects to the database and bootstraps the schema
//! - Starts the stalled-job detector and the queue recovery poller
//! - Starts the retention pruner
//! - Optionally serves the health check endpoint
//! - Runs the worker loop until a shutdown signal arrives
//!
//! Configuration is via environment variables; see `conveyor::config`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use sqlx::PgPool;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor::config::DispatchMode;
use conveyor::coordinator::{
    CoordinatorSettings, QueueCoordinator, RecoveryTask, StalledDetectorConfig, StalledDetectorTask,
};
use conveyor::execution::Execution;
use conveyor::health::HealthServer;
use conveyor::pruner::PrunerTask;
use conveyor::queue::PostgresQueue;
use conveyor::store::{ExecutionStore, PostgresStore};
use conveyor::worker::{RunOutcome, Worker, WorkerSettings, WorkflowRuntime};
use conveyor::{Config, db};

/// Placeholder runtime until a real node executor is wired in.
///
/// Acknowledges the cooperative checkpoint contract: it polls the
/// cancellation token between steps.
struct NoopRuntime;

#[async_trait::async_trait]
impl WorkflowRuntime for NoopRuntime {
    async fn run(
        &self,
        execution: Execution,
        cancel: tokio_util::sync::CancellationToken,
    ) -> RunOutcome {
        if cancel.is_cancelled() {
            return RunOutcome::canceled();
        }
        RunOutcome::success(Some(serde_json::json!({
            "workflow_id": execution.workflow_id,
        })))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    if config.dispatch_mode != DispatchMode::Queue {
        bail!("the worker process requires CONVEYOR_EXECUTIONS_MODE=queue");
    }

    info!(
        lock_duration_ms = config.queue.lock_duration.as_millis(),
        lock_renew_ms = config.queue.lock_renew_time.as_millis(),
        stalled_interval_ms = config.queue.stalled_interval.map(|value| value.as_millis()),
        max_stalled_count = config.queue.max_stalled_count,
        recovery_interval_s = config.queue.recovery_interval.map(|value| value.as_secs()),
        concurrency = config.queue.worker_concurrency,
        prune_enabled = config.prune.enabled,
        "starting worker infrastructure"
    );

    // Wire shutdown coordination.
    let shutdown_token = tokio_util::sync::CancellationToken::new();

    // Initialize the database and backends.
    let pool = PgPool::connect(&config.database_url).await?;
    db::run_migrations(&pool, &config.queue.prefix).await?;
    let store = PostgresStore::new(pool.clone());
    let store_dyn: Arc<dyn ExecutionStore> = Arc::new(store.clone());
    let queue = Arc::new(PostgresQueue::new(pool, &config.queue.prefix));

    let coordinator = QueueCoordinator::new(queue.clone(), CoordinatorSettings::from(&config.queue));
    let health = coordinator.health();

    // Start the health endpoint.
    let health_server = HealthServer::start(&config.health, health.clone()).await?;

    // Start the stalled-job detector.
    let stalled_handle = {
        let task = StalledDetectorTask {
            backend: queue.clone(),
            store: store_dyn.clone(),
            config: StalledDetectorConfig {
                interval: config.queue.stalled_interval,
                max_stalled_count: config.queue.max_stalled_count,
                batch_size: 100,
            },
            health: health.clone(),
        };
        tokio::spawn(task.run(shutdown_token.clone().cancelled_owned()))
    };

    // Start the recovery poller.
    let recovery_handle = {
        let task = RecoveryTask {
            backend: queue.clone(),
            store: store_dyn.clone(),
            interval: config.queue.recovery_interval,
            max_stalled_count: config.queue.max_stalled_count,
            batch_size: 100,
            health: health.clone(),
        };
        tokio::spawn(task.run(shutdown_token.clone().cancelled_owned()))
    };

    // Start the retention pruner.
    let pruner_handle = {
        let task = PrunerTask {
            store: store.clone(),
            config: config.prune.clone(),
        };
        tokio::spawn(task.run(shutdown_token.clone().cancelled_owned()))
    };

    let shutdown_handle = tokio::spawn({
        let shutdown_token = shutdown_token.clone();
        async move {
            if let Err(err) = wait_for_shutdown().await {
                error!(error = %err, "shutdown signal listener failed");
                return;
            }
            info!("shutdown signal received");
            shutdown_token.cancel();
        }
    });

    // Run the worker loop until shutdown.
    let worker_id = format!("conveyor-worker-{}", uuid::Uuid::new_v4());
    let worker = Worker::new(
        worker_id,
        coordinator,
        store_dyn,
        Arc::new(NoopRuntime),
        WorkerSettings::from_config(&config),
    );
    worker.run(shutdown_token.clone()).await;

    let _ = shutdown_handle.await;
    let _ = tokio::time::timeout(Duration::from_secs(5), stalled_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), recovery_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), pruner_handle).await;

    if let Some(server) = health_server {
        server.shutdown().await;
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}
