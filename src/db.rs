//! Database schema bootstrap.

use sqlx::PgPool;

/// Create the executions and jobs tables if they do not exist.
///
/// The jobs table is namespaced by the configured queue prefix so multiple
/// deployments can share one database.
pub async fn run_migrations(pool: &PgPool, queue_prefix: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id UUID PRIMARY KEY,
            workflow_id UUID NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            data JSONB,
            error JSONB,
            timeout_secs BIGINT,
            save_policy JSONB NOT NULL,
            prune_eligible BOOLEAN NOT NULL DEFAULT FALSE,
            deleted_at TIMESTAMPTZ,
            purged BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS executions_finished_at_idx ON executions (finished_at) WHERE deleted_at IS NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS executions_deleted_at_idx ON executions (deleted_at) WHERE purged = FALSE",
    )
    .execute(pool)
    .await?;

    let jobs_table = format!("{queue_prefix}_jobs");
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {jobs_table} (
            execution_id UUID PRIMARY KEY,
            workflow_id UUID NOT NULL,
            enqueued_at TIMESTAMPTZ NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            lock_token UUID,
            lock_expires_at TIMESTAMPTZ,
            attempts INTEGER NOT NULL DEFAULT 0,
            stalled_count INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            worker_id TEXT
        )
        "#,
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {jobs_table}_pending_idx ON {jobs_table} (enqueued_at) WHERE state = 'pending'",
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {jobs_table}_expiry_idx ON {jobs_table} (lock_expires_at) WHERE state = 'leased'",
    ))
    .execute(pool)
    .await?;

    Ok(())
}
