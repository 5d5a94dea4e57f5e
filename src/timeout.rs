//! Per-execution timeout enforcement.
//!
//! The enforcer drives a two-phase escalation for one running execution:
//! `Running -> SoftCancelRequested -> (ForceKilled | FinishedNaturally)`. At
//! the configured timeout it triggers the execution's cooperative
//! cancellation token, observed by the runtime at node-boundary checkpoints.
//! If the execution is still live after a further `timeout / 5` grace period
//! the task is aborted outright and must be reported as crashed with a
//! timed-out error.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Raised when execution timeout configuration is rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeoutConfigError {
    #[error("workflow timeout of {requested}s exceeds the maximum of {max}s")]
    ExceedsMax { requested: u64, max: u64 },

    #[error("invalid timeout value {0}; use -1 to disable or a positive number of seconds")]
    Invalid(i64),
}

/// Validate a requested timeout against the configured ceiling.
///
/// `-1` disables timeout enforcement. Values above `max_secs` are rejected at
/// configuration time, never silently clamped.
pub fn validate_timeout(
    requested_secs: i64,
    max_secs: u64,
) -> Result<Option<Duration>, TimeoutConfigError> {
    match requested_secs {
        -1 => Ok(None),
        secs if secs <= 0 => Err(TimeoutConfigError::Invalid(secs)),
        secs => {
            let secs = secs as u64;
            if secs > max_secs {
                return Err(TimeoutConfigError::ExceedsMax {
                    requested: secs,
                    max: max_secs,
                });
            }
            Ok(Some(Duration::from_secs(secs)))
        }
    }
}

/// Grace period granted after the cooperative cancellation signal.
pub fn grace_period(timeout: Duration) -> Duration {
    timeout / 5
}

/// Outcome of running an execution under the enforcer.
#[derive(Debug)]
pub enum EnforcedOutcome<T> {
    /// Finished before the soft deadline.
    Completed(T),
    /// Finished after cooperative cancellation was requested.
    CanceledAfterTimeout(T),
    /// Still live after the grace period; the task was aborted.
    ForceKilled,
    /// The execution task panicked.
    Panicked(String),
}

/// Run a spawned execution task under the two-phase timeout.
///
/// `cancel` is the execution's cooperative cancellation token; triggering it
/// is the soft phase. Aborting `handle` is the hard phase, taken only after
/// the grace period. With `timeout = None` the enforcer only awaits the task.
pub async fn enforce<T>(
    execution_id: Uuid,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    mut handle: JoinHandle<T>,
) -> EnforcedOutcome<T> {
    let Some(timeout) = timeout else {
        return match (&mut handle).await {
            Ok(value) => EnforcedOutcome::Completed(value),
            Err(err) => join_failure(err),
        };
    };

    tokio::select! {
        result = &mut handle => {
            return match result {
                Ok(value) => EnforcedOutcome::Completed(value),
                Err(err) => join_failure(err),
            };
        }
        _ = tokio::time::sleep(timeout) => {}
    }

    // Soft phase: cooperative, observed at the next safe checkpoint.
    info!(
        execution_id = %execution_id,
        timeout_secs = timeout.as_secs_f64(),
        "execution timeout reached; requesting cooperative cancellation"
    );
    cancel.cancel();

    tokio::select! {
        result = &mut handle => {
            return match result {
                Ok(value) => EnforcedOutcome::CanceledAfterTimeout(value),
                Err(err) => join_failure(err),
            };
        }
        _ = tokio::time::sleep(grace_period(timeout)) => {}
    }

    // Hard phase: the execution ignored the checkpoint signal.
    warn!(
        execution_id = %execution_id,
        grace_secs = grace_period(timeout).as_secs_f64(),
        "grace period elapsed; force-terminating execution"
    );
    handle.abort();
    match handle.await {
        Err(err) if err.is_cancelled() => EnforcedOutcome::ForceKilled,
        Err(err) => join_failure(err),
        // The task won the race against the abort.
        Ok(value) => EnforcedOutcome::CanceledAfterTimeout(value),
    }
}

fn join_failure<T>(err: tokio::task::JoinError) -> EnforcedOutcome<T> {
    if err.is_cancelled() {
        EnforcedOutcome::ForceKilled
    } else {
        EnforcedOutcome::Panicked(err.to_string())
    }
}
