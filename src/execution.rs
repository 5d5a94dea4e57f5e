//! Execution records and lifecycle status.
//!
//! An [`Execution`] tracks one unit of workflow work from creation through a
//! terminal status. Status transitions are monotonic: `New -> Running ->
//! terminal`, and a terminal execution is never reopened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How an execution was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Manual,
    Trigger,
    Queue,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Trigger => "trigger",
            Self::Queue => "queue",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "manual" => Ok(Self::Manual),
            "trigger" => Ok(Self::Trigger),
            "queue" => Ok(Self::Queue),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// Lifecycle status of an execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    New,
    Running,
    Success,
    Error,
    Canceled,
    Crashed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Canceled => "canceled",
            Self::Crashed => "crashed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Canceled | Self::Crashed
        )
    }

    /// Whether moving to `next` preserves the monotonic lifecycle.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match self {
            Self::New => matches!(next, Self::Running) || next.is_terminal(),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "new" => Ok(Self::New),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            "crashed" => Ok(Self::Crashed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Raised on an illegal lifecycle transition.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("illegal execution status transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// Whether to keep payload data for a given outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveData {
    All,
    None,
}

impl std::str::FromStr for SaveData {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "all" => Ok(Self::All),
            "none" => Ok(Self::None),
            other => Err(format!("unknown save data setting: {other}")),
        }
    }
}

/// Resolved payload retention policy for one execution.
///
/// Defaults come from configuration; workflow settings may override them at
/// execution creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavePolicy {
    pub on_error: SaveData,
    pub on_success: SaveData,
    pub save_progress: bool,
    pub save_manual: bool,
}

impl Default for SavePolicy {
    fn default() -> Self {
        Self {
            on_error: SaveData::All,
            on_success: SaveData::All,
            save_progress: false,
            save_manual: true,
        }
    }
}

impl SavePolicy {
    /// Whether payload data for an execution with this outcome is retained.
    ///
    /// An execution whose policy discards its payload class is eligible for
    /// soft deletion immediately upon completion.
    pub fn retains_data(&self, status: ExecutionStatus, mode: ExecutionMode) -> bool {
        if mode == ExecutionMode::Manual && !self.save_manual {
            return false;
        }
        match status {
            ExecutionStatus::Success => self.on_success == SaveData::All,
            ExecutionStatus::Error | ExecutionStatus::Crashed | ExecutionStatus::Canceled => {
                self.on_error == SaveData::All
            }
            ExecutionStatus::New | ExecutionStatus::Running => true,
        }
    }
}

/// Distinguishable cause attached to a failed execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// The execution exceeded its time budget and was terminated.
    TimedOut { timeout_secs: u64 },
    /// The job exhausted its stall retry budget and was dead-lettered.
    StallRetriesExceeded { stalled_count: u32 },
    /// The workflow runtime reported a failure.
    Runtime { message: String },
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut { timeout_secs } => {
                write!(f, "execution timed out after {timeout_secs}s")
            }
            Self::StallRetriesExceeded { stalled_count } => {
                write!(f, "exceeded stall retries ({stalled_count})")
            }
            Self::Runtime { message } => f.write_str(message),
        }
    }
}

/// One unit of workflow work, tracked from creation to a terminal status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Node-output payload; retained only per the resolved save policy.
    pub data: Option<serde_json::Value>,
    pub error: Option<ExecutionFailure>,
    /// Per-execution timeout in seconds, validated against the ceiling at
    /// creation. None disables the enforcer for this execution.
    pub timeout_secs: Option<u64>,
    pub save_policy: SavePolicy,
    /// Soft-delete marker set by the retention pruner.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Set once the payload has been irreversibly purged.
    pub purged: bool,
}

impl Execution {
    pub fn new(workflow_id: Uuid, mode: ExecutionMode, save_policy: SavePolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            mode,
            status: ExecutionStatus::New,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            data: None,
            error: None,
            timeout_secs: None,
            save_policy,
            deleted_at: None,
            purged: false,
        }
    }

    fn transition(&mut self, next: ExecutionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_started(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Running)?;
        self.started_at = Some(at);
        Ok(())
    }

    /// Move to a terminal status, recording outcome data per the save policy.
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        error: Option<ExecutionFailure>,
        data: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        debug_assert!(status.is_terminal());
        self.transition(status)?;
        self.finished_at = Some(at);
        self.error = error;
        self.data = if self.save_policy.retains_data(status, self.mode) {
            data
        } else {
            None
        };
        Ok(())
    }

    /// Payload access; undefined (empty) after the payload was purged.
    pub fn payload(&self) -> Option<&serde_json::Value> {
        if self.purged { None } else { self.data.as_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> Execution {
        Execution::new(Uuid::new_v4(), ExecutionMode::Trigger, SavePolicy::default())
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let mut execution = execution();
        execution.mark_started(Utc::now()).expect("start");
        execution
            .finish(ExecutionStatus::Success, None, None, Utc::now())
            .expect("finish");

        let err = execution
            .mark_started(Utc::now())
            .expect_err("terminal executions are never reopened");
        assert_eq!(err.from, ExecutionStatus::Success);

        let err = execution
            .finish(ExecutionStatus::Error, None, None, Utc::now())
            .expect_err("terminal to terminal is illegal");
        assert_eq!(err.to, ExecutionStatus::Error);
    }

    #[test]
    fn new_execution_may_finish_without_running() {
        // Dead-lettered jobs are failed without ever starting.
        let mut execution = execution();
        execution
            .finish(
                ExecutionStatus::Error,
                Some(ExecutionFailure::StallRetriesExceeded { stalled_count: 2 }),
                None,
                Utc::now(),
            )
            .expect("finish from new");
        assert_eq!(execution.status, ExecutionStatus::Error);
    }

    #[test]
    fn save_policy_discards_payload_for_matching_outcome() {
        let policy = SavePolicy {
            on_error: SaveData::None,
            on_success: SaveData::All,
            save_progress: false,
            save_manual: true,
        };
        assert!(policy.retains_data(ExecutionStatus::Success, ExecutionMode::Trigger));
        assert!(!policy.retains_data(ExecutionStatus::Error, ExecutionMode::Trigger));
        assert!(!policy.retains_data(ExecutionStatus::Crashed, ExecutionMode::Trigger));

        let manual_off = SavePolicy {
            save_manual: false,
            ..SavePolicy::default()
        };
        assert!(!manual_off.retains_data(ExecutionStatus::Success, ExecutionMode::Manual));
        assert!(manual_off.retains_data(ExecutionStatus::Success, ExecutionMode::Queue));
    }

    #[test]
    fn finish_applies_save_policy() {
        let mut execution = Execution::new(
            Uuid::new_v4(),
            ExecutionMode::Queue,
            SavePolicy {
                on_success: SaveData::None,
                ..SavePolicy::default()
            },
        );
        execution.mark_started(Utc::now()).expect("start");
        execution
            .finish(
                ExecutionStatus::Success,
                None,
                Some(serde_json::json!({"out": 1})),
                Utc::now(),
            )
            .expect("finish");
        assert!(execution.data.is_none());
    }

    #[test]
    fn purged_execution_exposes_no_payload() {
        let mut execution = execution();
        execution.data = Some(serde_json::json!({"out": 1}));
        assert!(execution.payload().is_some());
        execution.purged = true;
        assert!(execution.payload().is_none());
    }
}
