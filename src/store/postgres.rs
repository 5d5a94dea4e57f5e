//! Postgres execution store.
//!
//! Pruning passes use the same `FOR UPDATE SKIP LOCKED` claim pattern as the
//! queue so concurrent pruner processes never block each other, and delete
//! statements stay bounded by the configured batch size.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::{ExecutionStore, StoreError, StoreResult};
use crate::execution::{
    Execution, ExecutionFailure, ExecutionMode, ExecutionStatus, TransitionError,
};

const TERMINAL_STATUSES: &str = "'success', 'error', 'canceled', 'crashed'";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_execution(row: &PgRow) -> StoreResult<Execution> {
        let status: String = row.get("status");
        let mode: String = row.get("mode");
        let save_policy: serde_json::Value = row.get("save_policy");
        let error: Option<serde_json::Value> = row.get("error");
        let timeout_secs: Option<i64> = row.get("timeout_secs");
        Ok(Execution {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            mode: ExecutionMode::from_str(&mode).map_err(StoreError::Backend)?,
            status: ExecutionStatus::from_str(&status).map_err(StoreError::Backend)?,
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            data: row.get("data"),
            error: error.map(serde_json::from_value).transpose()?,
            timeout_secs: timeout_secs.map(|secs| secs.max(0) as u64),
            save_policy: serde_json::from_value(save_policy)?,
            deleted_at: row.get("deleted_at"),
            purged: row.get("purged"),
        })
    }
}

#[async_trait]
impl ExecutionStore for PostgresStore {
    async fn insert(&self, execution: &Execution) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, workflow_id, mode, status, created_at, started_at,
                finished_at, data, error, timeout_secs, save_policy,
                prune_eligible, deleted_at, purged
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, FALSE, $12, $13)
            "#,
        )
        .bind(execution.id)
        .bind(execution.workflow_id)
        .bind(execution.mode.as_str())
        .bind(execution.status.as_str())
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(&execution.data)
        .bind(
            execution
                .error
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(execution.timeout_secs.map(|secs| secs as i64))
        .bind(serde_json::to_value(execution.save_policy)?)
        .bind(execution.deleted_at)
        .bind(execution.purged)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> StoreResult<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn mark_started(&self, execution_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'running', started_at = $2 WHERE id = $1 AND status = 'new'",
        )
        .bind(execution_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let current = self
                .get(execution_id)
                .await?
                .ok_or(StoreError::NotFound(execution_id))?;
            return Err(TransitionError {
                from: current.status,
                to: ExecutionStatus::Running,
            }
            .into());
        }
        Ok(())
    }

    async fn finish(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<ExecutionFailure>,
        data: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1 FOR UPDATE")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await?;
        let row = row.ok_or(StoreError::NotFound(execution_id))?;
        let mut execution = Self::row_to_execution(&row)?;

        // Applies the save policy and rejects non-monotonic transitions.
        execution.finish(status, error, data, at)?;
        let prune_eligible = !execution.save_policy.retains_data(status, execution.mode);

        sqlx::query(
            r#"
            UPDATE executions
            SET status = $2, finished_at = $3, data = $4, error = $5, prune_eligible = $6
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(execution.status.as_str())
        .bind(execution.finished_at)
        .bind(&execution.data)
        .bind(
            execution
                .error
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(prune_eligible)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn count_stored(&self) -> StoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS stored FROM executions WHERE deleted_at IS NULL")
            .fetch_one(&self.pool)
            .await?;
        let stored: i64 = row.get("stored");
        Ok(stored.max(0) as u64)
    }

    async fn soft_delete_prunable(
        &self,
        cutoff: DateTime<Utc>,
        batch: usize,
    ) -> StoreResult<usize> {
        if batch == 0 {
            return Ok(0);
        }
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT id
                FROM executions
                WHERE deleted_at IS NULL
                  AND status IN ({TERMINAL_STATUSES})
                  AND (finished_at < $1 OR prune_eligible)
                ORDER BY finished_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE executions AS e
            SET deleted_at = $3
            FROM candidates
            WHERE e.id = candidates.id
            "#,
        );
        let result = sqlx::query(&sql)
            .bind(cutoff)
            .bind(batch as i64)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn soft_delete_over_count(&self, max_count: u64, batch: usize) -> StoreResult<usize> {
        if batch == 0 {
            return Ok(0);
        }
        let stored = self.count_stored().await?;
        if stored <= max_count {
            return Ok(0);
        }
        let limit = std::cmp::min(batch as u64, stored - max_count);

        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT id
                FROM executions
                WHERE deleted_at IS NULL
                  AND status IN ({TERMINAL_STATUSES})
                  AND finished_at IS NOT NULL
                ORDER BY finished_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE executions AS e
            SET deleted_at = $2
            FROM candidates
            WHERE e.id = candidates.id
            "#,
        );
        let result = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn hard_delete_before(&self, cutoff: DateTime<Utc>, batch: usize) -> StoreResult<usize> {
        if batch == 0 {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT id
                FROM executions
                WHERE purged = FALSE
                  AND deleted_at IS NOT NULL
                  AND deleted_at < $1
                ORDER BY deleted_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE executions AS e
            SET data = NULL, purged = TRUE
            FROM candidates
            WHERE e.id = candidates.id
            "#,
        )
        .bind(cutoff)
        .bind(batch as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}
