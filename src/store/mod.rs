//! Persistence abstraction for execution records.
//!
//! The store owns execution CRUD plus the batched, idempotent delete
//! operations the retention pruner runs. All mutation goes through guarded
//! single-statement updates (or one mutex critical section in the memory
//! implementation), so the monotonic status invariant holds across
//! concurrent processes.

mod memory;
mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::execution::{Execution, ExecutionFailure, ExecutionStatus, TransitionError};

/// Raised when a store operation cannot complete.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistent store for execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, execution: &Execution) -> StoreResult<()>;

    async fn get(&self, execution_id: Uuid) -> StoreResult<Option<Execution>>;

    /// Transition `New -> Running`, recording the start time.
    async fn mark_started(&self, execution_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    /// Move to a terminal status. The save policy resolved at creation
    /// decides whether `data` is retained; executions whose policy discards
    /// their payload class become immediately eligible for soft deletion.
    async fn finish(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<ExecutionFailure>,
        data: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Number of executions not yet soft-deleted.
    async fn count_stored(&self) -> StoreResult<u64>;

    /// Soft-delete up to `batch` terminal executions that finished before
    /// `cutoff` or whose save policy made them immediately prunable.
    /// Never touches a non-terminal execution. Returns rows marked.
    async fn soft_delete_prunable(
        &self,
        cutoff: DateTime<Utc>,
        batch: usize,
    ) -> StoreResult<usize>;

    /// Soft-delete up to `batch` of the oldest-finished terminal executions
    /// while the stored count exceeds `max_count`. Approximate by design.
    async fn soft_delete_over_count(&self, max_count: u64, batch: usize) -> StoreResult<usize>;

    /// Irreversibly purge payloads of up to `batch` executions soft-deleted
    /// before `cutoff`, marking them purged. Idempotent: already-purged rows
    /// are not selected again.
    async fn hard_delete_before(&self, cutoff: DateTime<Utc>, batch: usize) -> StoreResult<usize>;
}
