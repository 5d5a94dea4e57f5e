//! Conveyor: execution lifecycle management and distributed queue
//! coordination for an automation engine.
//!
//! Three cooperating components operate over a shared execution record and
//! a shared queue backend:
//!
//! - the **timeout enforcer** ([`timeout`]) bounds how long an execution may
//!   run, escalating from cooperative cancellation to a forced kill;
//! - the **queue coordinator** ([`coordinator`]) lets any number of worker
//!   processes safely pull and complete jobs via a lease/heartbeat protocol
//!   with stalled-job detection and crash recovery;
//! - the **retention pruner** ([`pruner`]) bounds stored execution history
//!   by age and count with two-phase (soft, then hard) deletion.
//!
//! Producers create executions through [`producer::Producer`]; workers run
//! them through [`worker::Worker`]. Both sides talk to pluggable backends:
//! [`store::ExecutionStore`] for execution records and
//! [`queue::QueueBackend`] for the lease protocol, each shipped with
//! Postgres and in-memory implementations.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod execution;
pub mod health;
pub mod producer;
pub mod pruner;
pub mod queue;
pub mod store;
pub mod timeout;
pub mod worker;

pub use config::{Config, DispatchMode};
pub use coordinator::{
    CoordinatorSettings, HealthState, QueueCoordinator, RecoveryTask, StalledDetectorConfig,
    StalledDetectorTask,
};
pub use execution::{Execution, ExecutionFailure, ExecutionMode, ExecutionStatus, SavePolicy};
pub use health::HealthServer;
pub use producer::{Producer, WorkflowSettings};
pub use pruner::PrunerTask;
pub use queue::{Job, LeasedJob, MemoryQueue, PostgresQueue, QueueBackend, QueueError};
pub use store::{ExecutionStore, MemoryStore, PostgresStore, StoreError};
pub use worker::{RunOutcome, Worker, WorkerSettings, WorkflowRuntime};
