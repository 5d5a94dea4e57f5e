//! In-memory queue backend for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    ExpiredLease, Job, JobState, LeasedJob, QueueBackend, QueueError, QueueResult, ReclaimOutcome,
};

#[derive(Clone, Debug)]
struct JobRecord {
    job: Job,
    state: JobState,
    token: Option<Uuid>,
    lock_expiry: Option<DateTime<Utc>>,
    attempts: u32,
    stalled_count: u32,
    error: Option<String>,
}

/// Queue backend holding all state behind a single mutex.
///
/// Lease atomicity falls out of the mutex: every protocol operation is one
/// critical section.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    jobs: Arc<Mutex<HashMap<Uuid, JobRecord>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently pending.
    pub fn pending_len(&self) -> usize {
        self.jobs
            .lock()
            .expect("jobs poisoned")
            .values()
            .filter(|record| record.state == JobState::Pending)
            .count()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        let mut jobs = self.jobs.lock().expect("jobs poisoned");
        if jobs.contains_key(&job.execution_id) {
            return Err(QueueError::DuplicateJob(job.execution_id));
        }
        jobs.insert(
            job.execution_id,
            JobRecord {
                job: job.clone(),
                state: JobState::Pending,
                token: None,
                lock_expiry: None,
                attempts: 0,
                stalled_count: 0,
                error: None,
            },
        );
        Ok(())
    }

    async fn claim_one(
        &self,
        _worker_id: &str,
        lock_duration: Duration,
    ) -> QueueResult<Option<LeasedJob>> {
        let mut jobs = self.jobs.lock().expect("jobs poisoned");
        // FIFO by enqueue order; reclaimed jobs keep their original
        // enqueued_at and therefore re-enter at the front.
        let next = jobs
            .values()
            .filter(|record| record.state == JobState::Pending)
            .min_by_key(|record| (record.job.enqueued_at, record.job.execution_id))
            .map(|record| record.job.execution_id);
        let Some(execution_id) = next else {
            return Ok(None);
        };

        let record = jobs.get_mut(&execution_id).expect("job vanished");
        let token = Uuid::new_v4();
        let lock_expiry = Utc::now()
            + chrono::Duration::from_std(lock_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        record.state = JobState::Leased;
        record.token = Some(token);
        record.lock_expiry = Some(lock_expiry);
        record.attempts += 1;

        Ok(Some(LeasedJob {
            job: record.job.clone(),
            token,
            lock_expiry,
            attempts: record.attempts,
            stalled_count: record.stalled_count,
        }))
    }

    async fn renew_if_owner(
        &self,
        execution_id: Uuid,
        token: Uuid,
        lock_duration: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let mut jobs = self.jobs.lock().expect("jobs poisoned");
        let record = jobs
            .get_mut(&execution_id)
            .ok_or(QueueError::UnknownJob(execution_id))?;
        let now = Utc::now();
        if record.state != JobState::Leased
            || record.token != Some(token)
            || record.lock_expiry.is_none_or(|expiry| expiry <= now)
        {
            return Err(QueueError::LeaseLost { execution_id });
        }
        let lock_expiry = now
            + chrono::Duration::from_std(lock_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        record.lock_expiry = Some(lock_expiry);
        Ok(lock_expiry)
    }

    async fn ack_if_owner(&self, execution_id: Uuid, token: Uuid) -> QueueResult<()> {
        self.resolve_if_owner(execution_id, token, JobState::Completed, None)
    }

    async fn fail_if_owner(&self, execution_id: Uuid, token: Uuid, error: &str) -> QueueResult<()> {
        self.resolve_if_owner(
            execution_id,
            token,
            JobState::Failed,
            Some(error.to_string()),
        )
    }

    async fn release_if_owner(&self, execution_id: Uuid, token: Uuid) -> QueueResult<()> {
        let mut jobs = self.jobs.lock().expect("jobs poisoned");
        let record = jobs
            .get_mut(&execution_id)
            .ok_or(QueueError::UnknownJob(execution_id))?;
        if record.state != JobState::Leased || record.token != Some(token) {
            return Err(QueueError::LeaseLost { execution_id });
        }
        record.state = JobState::Pending;
        record.token = None;
        record.lock_expiry = None;
        Ok(())
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<ExpiredLease>> {
        let jobs = self.jobs.lock().expect("jobs poisoned");
        let mut expired: Vec<(DateTime<Utc>, ExpiredLease)> = jobs
            .values()
            .filter(|record| record.state == JobState::Leased)
            .filter_map(|record| {
                let expiry = record.lock_expiry?;
                let token = record.token?;
                (expiry <= now).then(|| {
                    (
                        expiry,
                        ExpiredLease {
                            execution_id: record.job.execution_id,
                            token,
                            stalled_count: record.stalled_count,
                        },
                    )
                })
            })
            .collect();
        expired.sort_by_key(|(expiry, lease)| (*expiry, lease.execution_id));
        Ok(expired
            .into_iter()
            .take(limit)
            .map(|(_, lease)| lease)
            .collect())
    }

    async fn reclaim_expired(
        &self,
        execution_id: Uuid,
        token: Uuid,
        max_stalled_count: u32,
    ) -> QueueResult<ReclaimOutcome> {
        let mut jobs = self.jobs.lock().expect("jobs poisoned");
        let record = jobs
            .get_mut(&execution_id)
            .ok_or(QueueError::UnknownJob(execution_id))?;
        let now = Utc::now();
        if record.state != JobState::Leased
            || record.token != Some(token)
            || record.lock_expiry.is_none_or(|expiry| expiry > now)
        {
            return Ok(ReclaimOutcome::AlreadyResolved);
        }

        record.stalled_count += 1;
        record.token = None;
        record.lock_expiry = None;
        if record.stalled_count >= max_stalled_count {
            record.state = JobState::DeadLetter;
            record.error = Some(format!(
                "exceeded stall retries ({})",
                record.stalled_count
            ));
            Ok(ReclaimOutcome::DeadLettered {
                stalled_count: record.stalled_count,
            })
        } else {
            record.state = JobState::Pending;
            Ok(ReclaimOutcome::Requeued {
                stalled_count: record.stalled_count,
            })
        }
    }

    async fn job_state(&self, execution_id: Uuid) -> QueueResult<Option<JobState>> {
        let jobs = self.jobs.lock().expect("jobs poisoned");
        Ok(jobs.get(&execution_id).map(|record| record.state))
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}

impl MemoryQueue {
    fn resolve_if_owner(
        &self,
        execution_id: Uuid,
        token: Uuid,
        state: JobState,
        error: Option<String>,
    ) -> QueueResult<()> {
        let mut jobs = self.jobs.lock().expect("jobs poisoned");
        let record = jobs
            .get_mut(&execution_id)
            .ok_or(QueueError::UnknownJob(execution_id))?;
        if record.state != JobState::Leased || record.token != Some(token) {
            return Err(QueueError::LeaseLost { execution_id });
        }
        record.state = state;
        record.token = None;
        record.lock_expiry = None;
        record.error = error;
        Ok(())
    }
}
