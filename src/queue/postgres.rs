//! Postgres queue backend.
//!
//! Lease atomicity rides on single-statement updates guarded by the lock
//! token, and claiming uses the `FOR UPDATE SKIP LOCKED` pattern so
//! concurrent workers never block each other on the same pending row.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{
    ExpiredLease, Job, JobState, LeasedJob, QueueBackend, QueueError, QueueResult, ReclaimOutcome,
};

const DEAD_LETTER_CAUSE: &str = "exceeded stall retries";

/// Queue backend over a shared Postgres jobs table.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    table: String,
}

impl PostgresQueue {
    /// The jobs table is namespaced by the configured queue prefix.
    pub fn new(pool: PgPool, prefix: &str) -> Self {
        Self {
            pool,
            table: format!("{prefix}_jobs"),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn parse_state(value: &str) -> QueueResult<JobState> {
        JobState::from_str(value).map_err(QueueError::Backend)
    }
}

#[async_trait]
impl QueueBackend for PostgresQueue {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} (execution_id, workflow_id, enqueued_at, state)
            VALUES ($1, $2, $3, 'pending')
            ON CONFLICT (execution_id) DO NOTHING
            "#,
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(job.execution_id)
            .bind(job.workflow_id)
            .bind(job.enqueued_at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::DuplicateJob(job.execution_id));
        }
        Ok(())
    }

    async fn claim_one(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> QueueResult<Option<LeasedJob>> {
        let token = Uuid::new_v4();
        let lock_expiry = Utc::now()
            + chrono::Duration::from_std(lock_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let sql = format!(
            r#"
            WITH next AS (
                SELECT execution_id
                FROM {table}
                WHERE state = 'pending'
                ORDER BY enqueued_at, execution_id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} AS jobs
            SET state = 'leased',
                lock_token = $1,
                lock_expires_at = $2,
                attempts = jobs.attempts + 1,
                worker_id = $3
            FROM next
            WHERE jobs.execution_id = next.execution_id
            RETURNING jobs.execution_id, jobs.workflow_id, jobs.enqueued_at,
                      jobs.attempts, jobs.stalled_count
            "#,
            table = self.table,
        );
        let row = sqlx::query(&sql)
            .bind(token)
            .bind(lock_expiry)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| {
            let attempts: i32 = row.get("attempts");
            let stalled_count: i32 = row.get("stalled_count");
            LeasedJob {
                job: Job {
                    execution_id: row.get("execution_id"),
                    workflow_id: row.get("workflow_id"),
                    enqueued_at: row.get("enqueued_at"),
                },
                token,
                lock_expiry,
                attempts: attempts.max(0) as u32,
                stalled_count: stalled_count.max(0) as u32,
            }
        }))
    }

    async fn renew_if_owner(
        &self,
        execution_id: Uuid,
        token: Uuid,
        lock_duration: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let now = Utc::now();
        let lock_expiry = now
            + chrono::Duration::from_std(lock_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let sql = format!(
            r#"
            UPDATE {table}
            SET lock_expires_at = $3
            WHERE execution_id = $1
              AND lock_token = $2
              AND state = 'leased'
              AND lock_expires_at > $4
            "#,
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(execution_id)
            .bind(token)
            .bind(lock_expiry)
            .bind(now)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost { execution_id });
        }
        Ok(lock_expiry)
    }

    async fn ack_if_owner(&self, execution_id: Uuid, token: Uuid) -> QueueResult<()> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET state = 'completed', lock_token = NULL, lock_expires_at = NULL
            WHERE execution_id = $1 AND lock_token = $2 AND state = 'leased'
            "#,
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(execution_id)
            .bind(token)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost { execution_id });
        }
        Ok(())
    }

    async fn fail_if_owner(&self, execution_id: Uuid, token: Uuid, error: &str) -> QueueResult<()> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET state = 'failed', error = $3, lock_token = NULL, lock_expires_at = NULL
            WHERE execution_id = $1 AND lock_token = $2 AND state = 'leased'
            "#,
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(execution_id)
            .bind(token)
            .bind(error)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost { execution_id });
        }
        Ok(())
    }

    async fn release_if_owner(&self, execution_id: Uuid, token: Uuid) -> QueueResult<()> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET state = 'pending', lock_token = NULL, lock_expires_at = NULL, worker_id = NULL
            WHERE execution_id = $1 AND lock_token = $2 AND state = 'leased'
            "#,
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(execution_id)
            .bind(token)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost { execution_id });
        }
        Ok(())
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<ExpiredLease>> {
        let sql = format!(
            r#"
            SELECT execution_id, lock_token, stalled_count
            FROM {table}
            WHERE state = 'leased' AND lock_expires_at <= $1
            ORDER BY lock_expires_at, execution_id
            LIMIT $2
            "#,
            table = self.table,
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let stalled_count: i32 = row.get("stalled_count");
                ExpiredLease {
                    execution_id: row.get("execution_id"),
                    token: row.get("lock_token"),
                    stalled_count: stalled_count.max(0) as u32,
                }
            })
            .collect())
    }

    async fn reclaim_expired(
        &self,
        execution_id: Uuid,
        token: Uuid,
        max_stalled_count: u32,
    ) -> QueueResult<ReclaimOutcome> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET stalled_count = stalled_count + 1,
                state = CASE WHEN stalled_count + 1 >= $3 THEN 'dead_letter' ELSE 'pending' END,
                error = CASE WHEN stalled_count + 1 >= $3 THEN $4 ELSE error END,
                lock_token = NULL,
                lock_expires_at = NULL,
                worker_id = NULL
            WHERE execution_id = $1
              AND lock_token = $2
              AND state = 'leased'
              AND lock_expires_at <= $5
            RETURNING stalled_count, state
            "#,
            table = self.table,
        );
        let row = sqlx::query(&sql)
            .bind(execution_id)
            .bind(token)
            .bind(max_stalled_count as i32)
            .bind(DEAD_LETTER_CAUSE)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(ReclaimOutcome::AlreadyResolved);
        };
        let stalled_count: i32 = row.get("stalled_count");
        let stalled_count = stalled_count.max(0) as u32;
        let state: String = row.get("state");
        match Self::parse_state(&state)? {
            JobState::DeadLetter => Ok(ReclaimOutcome::DeadLettered { stalled_count }),
            _ => Ok(ReclaimOutcome::Requeued { stalled_count }),
        }
    }

    async fn job_state(&self, execution_id: Uuid) -> QueueResult<Option<JobState>> {
        let sql = format!(
            "SELECT state FROM {table} WHERE execution_id = $1",
            table = self.table,
        );
        let row = sqlx::query(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let state: String = row.get("state");
            Self::parse_state(&state)
        })
        .transpose()
    }

    async fn ping(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
