//! Worker loop: lease jobs, run them under the timeout enforcer, renew the
//! lease while working, and report the outcome.
//!
//! Within one worker, job execution, lease renewal, and timeout enforcement
//! run as independent tasks that observe each other's termination: renewal
//! stops the moment a job is reported, and a lost lease cancels the work
//! immediately since another worker may already hold the job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, QueueConfig};
use crate::coordinator::QueueCoordinator;
use crate::execution::{Execution, ExecutionFailure, ExecutionStatus};
use crate::queue::{LeasedJob, QueueError};
use crate::store::ExecutionStore;
use crate::timeout::{EnforcedOutcome, enforce};

/// Outcome reported by the workflow runtime for one execution.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub status: ExecutionStatus,
    pub data: Option<serde_json::Value>,
    pub error: Option<ExecutionFailure>,
}

impl RunOutcome {
    pub fn success(data: Option<serde_json::Value>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            data,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            data: None,
            error: Some(ExecutionFailure::Runtime {
                message: message.into(),
            }),
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: ExecutionStatus::Canceled,
            data: None,
            error: None,
        }
    }
}

/// The workflow execution runtime consumed by workers.
#[async_trait]
pub trait WorkflowRuntime: Send + Sync {
    /// Run one execution to completion. Implementations must observe
    /// `cancel` at node-boundary checkpoints and return promptly once it
    /// fires; in-flight node work is not interrupted mid-step.
    async fn run(&self, execution: Execution, cancel: CancellationToken) -> RunOutcome;
}

/// Worker-side settings derived from configuration.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Claim poll cadence while the queue is idle.
    pub poll_interval: Duration,
    pub lock_renew_time: Duration,
    pub concurrency: usize,
    pub graceful_shutdown_timeout: Duration,
    /// Fallback when an execution carries no timeout of its own.
    pub default_timeout: Option<Duration>,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self::from_queue_config(&config.queue, config.executions.default_timeout)
    }

    pub fn from_queue_config(queue: &QueueConfig, default_timeout: Option<Duration>) -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lock_renew_time: queue.lock_renew_time,
            concurrency: queue.worker_concurrency,
            graceful_shutdown_timeout: queue.graceful_shutdown_timeout,
            default_timeout,
        }
    }
}

/// Leases currently held by this worker process.
#[derive(Clone, Default)]
struct LeaseTracker {
    owned: Arc<Mutex<HashMap<Uuid, Uuid>>>,
}

impl LeaseTracker {
    fn insert(&self, execution_id: Uuid, token: Uuid) {
        self.owned
            .lock()
            .expect("lease tracker poisoned")
            .insert(execution_id, token);
    }

    fn remove(&self, execution_id: Uuid) {
        self.owned
            .lock()
            .expect("lease tracker poisoned")
            .remove(&execution_id);
    }

    fn snapshot(&self) -> Vec<(Uuid, Uuid)> {
        self.owned
            .lock()
            .expect("lease tracker poisoned")
            .iter()
            .map(|(execution_id, token)| (*execution_id, *token))
            .collect()
    }
}

/// One worker process pulling jobs from the shared queue.
#[derive(Clone)]
pub struct Worker {
    id: String,
    coordinator: QueueCoordinator,
    store: Arc<dyn ExecutionStore>,
    runtime: Arc<dyn WorkflowRuntime>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        coordinator: QueueCoordinator,
        store: Arc<dyn ExecutionStore>,
        runtime: Arc<dyn WorkflowRuntime>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: id.into(),
            coordinator,
            store,
            runtime,
            settings,
        }
    }

    /// Run the worker loop until shutdown.
    ///
    /// On shutdown the worker stops leasing, waits up to the graceful
    /// shutdown timeout for in-flight executions to finish naturally, then
    /// force-releases remaining leases for stalled-detection to reclaim.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.id,
            concurrency = self.settings.concurrency,
            lock_renew_ms = self.settings.lock_renew_time.as_millis(),
            "worker started"
        );

        let tracker = LeaseTracker::default();
        let mut active: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(worker_id = %self.id, "worker shutdown requested");
                    break;
                }
                Some(_) = active.join_next(), if !active.is_empty() => {}
                claimed = self.coordinator.lease(&self.id),
                    if active.len() < self.settings.concurrency =>
                {
                    match claimed {
                        Ok(Some(leased)) => {
                            tracker.insert(leased.job.execution_id, leased.token);
                            let worker = self.clone();
                            let tracker = tracker.clone();
                            active.spawn(async move {
                                worker.process(leased, tracker).await;
                            });
                        }
                        Ok(None) => {
                            tokio::time::sleep(self.settings.poll_interval).await;
                        }
                        Err(err) if err.is_retryable() => {
                            warn!(error = %err, "queue backend unreachable while leasing");
                            tokio::time::sleep(self.settings.poll_interval).await;
                        }
                        Err(err) => {
                            error!(error = %err, "lease failed");
                            tokio::time::sleep(self.settings.poll_interval).await;
                        }
                    }
                }
            }
        }

        // Drain phase: no new leases, give in-flight work its budget.
        if !active.is_empty() {
            info!(
                worker_id = %self.id,
                active = active.len(),
                timeout_secs = self.settings.graceful_shutdown_timeout.as_secs(),
                "waiting for in-flight executions"
            );
            let drained = tokio::time::timeout(self.settings.graceful_shutdown_timeout, async {
                while active.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    worker_id = %self.id,
                    "graceful shutdown timeout elapsed; abandoning remaining leases"
                );
                active.abort_all();
                while active.join_next().await.is_some() {}
                for (execution_id, token) in tracker.snapshot() {
                    if let Err(err) = self.coordinator.release(execution_id, token).await {
                        warn!(
                            execution_id = %execution_id,
                            error = %err,
                            "failed to release abandoned lease"
                        );
                    }
                }
            }
        }
        info!(worker_id = %self.id, "worker exiting");
    }

    /// Run one leased job to a reported outcome.
    async fn process(&self, leased: LeasedJob, tracker: LeaseTracker) {
        let execution_id = leased.job.execution_id;
        let token = leased.token;

        if let Err(err) = self.store.mark_started(execution_id, Utc::now()).await {
            // Races with the stalled detector: a dead-lettered execution is
            // already terminal and must not run again.
            warn!(execution_id = %execution_id, error = %err, "execution not startable");
            self.report_queue(execution_id, token, Some("execution not startable"))
                .await;
            tracker.remove(execution_id);
            return;
        }
        let execution = match self.store.get(execution_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                warn!(execution_id = %execution_id, "leased job has no execution record");
                self.report_queue(execution_id, token, Some("missing execution record"))
                    .await;
                tracker.remove(execution_id);
                return;
            }
            Err(err) => {
                error!(execution_id = %execution_id, error = %err, "failed to load execution");
                let _ = self.coordinator.release(execution_id, token).await;
                tracker.remove(execution_id);
                return;
            }
        };

        let timeout = execution
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.settings.default_timeout);
        let timeout_secs = timeout.map(|value| value.as_secs()).unwrap_or(0);

        let cancel = CancellationToken::new();
        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = spawn_lease_heartbeat(
            self.coordinator.clone(),
            execution_id,
            token,
            self.settings.lock_renew_time,
            cancel.clone(),
            lease_lost.clone(),
            heartbeat_stop.clone(),
        );

        let runtime = self.runtime.clone();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { runtime.run(execution, run_cancel).await });
        let outcome = enforce(execution_id, timeout, &cancel, handle).await;

        heartbeat_stop.cancel();
        let _ = heartbeat.await;
        tracker.remove(execution_id);

        if lease_lost.load(Ordering::SeqCst) {
            // Infrastructure event, not an execution failure: another worker
            // may already hold the job, so leave the record for
            // stalled-detection and recovery to resolve.
            warn!(
                execution_id = %execution_id,
                "lease lost during renewal; abandoning work"
            );
            return;
        }

        match outcome {
            EnforcedOutcome::Completed(run) => self.report(execution_id, token, run).await,
            EnforcedOutcome::CanceledAfterTimeout(mut run) => {
                // A timed-out job is reported as failed, never left leased.
                if run.error.is_none() && run.status != ExecutionStatus::Success {
                    run.error = Some(ExecutionFailure::TimedOut { timeout_secs });
                }
                self.report(execution_id, token, run).await;
            }
            EnforcedOutcome::ForceKilled => {
                let run = RunOutcome {
                    status: ExecutionStatus::Crashed,
                    data: None,
                    error: Some(ExecutionFailure::TimedOut { timeout_secs }),
                };
                self.report(execution_id, token, run).await;
            }
            EnforcedOutcome::Panicked(message) => {
                let run = RunOutcome {
                    status: ExecutionStatus::Crashed,
                    data: None,
                    error: Some(ExecutionFailure::Runtime { message }),
                };
                self.report(execution_id, token, run).await;
            }
        }
    }

    async fn report(&self, execution_id: Uuid, token: Uuid, run: RunOutcome) {
        debug!(
            execution_id = %execution_id,
            status = %run.status,
            "reporting execution outcome"
        );
        if let Err(err) = self
            .store
            .finish(
                execution_id,
                run.status,
                run.error.clone(),
                run.data,
                Utc::now(),
            )
            .await
        {
            warn!(execution_id = %execution_id, error = %err, "failed to record outcome");
        }

        let queue_error = match run.status {
            ExecutionStatus::Success => None,
            _ => Some(
                run.error
                    .map(|failure| failure.to_string())
                    .unwrap_or_else(|| run.status.to_string()),
            ),
        };
        self.report_queue(execution_id, token, queue_error.as_deref())
            .await;
    }

    async fn report_queue(&self, execution_id: Uuid, token: Uuid, error: Option<&str>) {
        let result = match error {
            None => self.coordinator.ack(execution_id, token).await,
            Some(error) => self.coordinator.fail(execution_id, token, error).await,
        };
        if let Err(err) = result {
            warn!(
                execution_id = %execution_id,
                error = %err,
                "failed to report job outcome to the queue"
            );
        }
    }
}

/// Renew the lease on a cadence while the job is being processed.
///
/// On a lost lease the heartbeat cancels the work token so the runtime stops
/// at its next checkpoint, and sets the flag the worker checks before
/// reporting.
fn spawn_lease_heartbeat(
    coordinator: QueueCoordinator,
    execution_id: Uuid,
    token: Uuid,
    interval: Duration,
    work_cancel: CancellationToken,
    lease_lost: Arc<AtomicBool>,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match coordinator.renew(execution_id, token).await {
                Ok(lock_expiry) => {
                    debug!(
                        execution_id = %execution_id,
                        lock_expiry = %lock_expiry,
                        "lease renewed"
                    );
                }
                Err(QueueError::LeaseLost { .. }) => {
                    warn!(execution_id = %execution_id, "lease lost during renewal");
                    lease_lost.store(true, Ordering::SeqCst);
                    work_cancel.cancel();
                    break;
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        execution_id = %execution_id,
                        error = %err,
                        "lease renewal failed; backend unreachable"
                    );
                }
                Err(err) => {
                    warn!(execution_id = %execution_id, error = %err, "lease renewal failed");
                }
            }
        }
    })
}
