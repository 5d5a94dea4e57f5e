//! Lease-protocol abstraction over the shared queue backend.
//!
//! The backend exposes the minimal primitives the coordinator needs
//! (claim-with-expiry, renew-if-owner, ack/fail, list-of-expired-leases) so
//! the concrete store (Postgres here, an in-memory fake for tests, or an
//! alternative broker) is swappable without touching coordinator logic.

mod memory;
mod postgres;

pub use self::memory::MemoryQueue;
pub use self::postgres::PostgresQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raised when a queue operation cannot complete.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The lease expired or was reassigned; the caller must abort work on
    /// this job immediately, since another worker may already hold it.
    #[error("lease lost for execution {execution_id}")]
    LeaseLost { execution_id: Uuid },

    #[error("no job found for execution {0}")]
    UnknownJob(Uuid),

    #[error("execution {0} is already enqueued")]
    DuplicateJob(Uuid),

    /// The backend cannot be reached right now; retryable.
    #[error("queue backend unreachable: {0}")]
    Unreachable(String),

    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl QueueError {
    /// Whether the caller may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Sqlx(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-side state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
    Completed,
    Failed,
    DeadLetter,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A queued unit of dispatch, 1:1 with an execution while queued.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(execution_id: Uuid, workflow_id: Uuid) -> Self {
        Self {
            execution_id,
            workflow_id,
            enqueued_at: Utc::now(),
        }
    }
}

/// A job claimed by a worker, with its active lease.
#[derive(Clone, Debug)]
pub struct LeasedJob {
    pub job: Job,
    /// Opaque lease token, unique per active lease.
    pub token: Uuid,
    pub lock_expiry: DateTime<Utc>,
    pub attempts: u32,
    pub stalled_count: u32,
}

/// A lease observed past its expiry.
#[derive(Clone, Debug)]
pub struct ExpiredLease {
    pub execution_id: Uuid,
    pub token: Uuid,
    pub stalled_count: u32,
}

/// Result of reclaiming one expired lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Returned to pending for re-leasing; carries the new stalled count.
    Requeued { stalled_count: u32 },
    /// Stall budget exhausted; the job is permanently failed.
    DeadLettered { stalled_count: u32 },
    /// The job moved on (acked, failed, or re-leased) before the reclaim.
    AlreadyResolved,
}

/// Minimal lease protocol over a shared backend.
///
/// Pending jobs are leased FIFO by enqueue order. A reclaimed stalled job
/// keeps its original `enqueued_at`, so it re-enters at the front of that
/// order and cannot be starved by new arrivals.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Add a job to the pending queue.
    async fn enqueue(&self, job: &Job) -> QueueResult<()>;

    /// Atomically claim one pending job for `worker_id`, setting
    /// `lock_expiry = now + lock_duration` and minting a fresh token.
    /// Returns None when nothing is pending.
    async fn claim_one(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> QueueResult<Option<LeasedJob>>;

    /// Extend the lease by `lock_duration` if `token` still owns it and the
    /// lease has not yet expired. Returns the new expiry, or
    /// [`QueueError::LeaseLost`].
    async fn renew_if_owner(
        &self,
        execution_id: Uuid,
        token: Uuid,
        lock_duration: Duration,
    ) -> QueueResult<DateTime<Utc>>;

    /// Mark the job completed if `token` still owns it.
    async fn ack_if_owner(&self, execution_id: Uuid, token: Uuid) -> QueueResult<()>;

    /// Mark the job failed if `token` still owns it.
    async fn fail_if_owner(&self, execution_id: Uuid, token: Uuid, error: &str) -> QueueResult<()>;

    /// Return the job to pending without a stall increment, if `token` still
    /// owns it. Used when a worker abandons leases on shutdown.
    async fn release_if_owner(&self, execution_id: Uuid, token: Uuid) -> QueueResult<()>;

    /// List leases past their expiry, oldest first.
    async fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<ExpiredLease>>;

    /// Atomically reclaim one expired lease: bump `stalled_count` and either
    /// requeue the job or dead-letter it once the count reaches
    /// `max_stalled_count`. A job that moved on since [`Self::list_expired`]
    /// reports [`ReclaimOutcome::AlreadyResolved`].
    async fn reclaim_expired(
        &self,
        execution_id: Uuid,
        token: Uuid,
        max_stalled_count: u32,
    ) -> QueueResult<ReclaimOutcome>;

    /// Current state of a job, if known.
    async fn job_state(&self, execution_id: Uuid) -> QueueResult<Option<JobState>>;

    /// Cheap reachability probe.
    async fn ping(&self) -> QueueResult<()>;
}
