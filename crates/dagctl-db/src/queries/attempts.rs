//! Database query functions for the `attempts` and `attempt_history` tables.

use chrono::{DateTime, Utc};
use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Attempt, AttemptHistoryEntry, AttemptStatus};

/// Insert a new attempt row, status `Queued`. `attempt_number` is computed
/// as one past whatever `(dag_name, run_id)` already has on file, so this
/// also covers the explicit-retry path's numbering without a separate
/// counter.
///
/// Returns `Ok(None)` if a non-terminal attempt already exists for
/// `(dag_name, run_id)` -- the partial unique index on the table enforces
/// this -- or if a concurrent insert won the race for the same
/// `(dag_name, run_id, attempt_number)` (full unique constraint). Either
/// way callers should surface `AttemptError::AlreadyExists`.
#[allow(clippy::too_many_arguments)]
pub async fn create_attempt(
    pool: &PgPool,
    dag_namespace: &str,
    dag_name: &str,
    run_id: &str,
    parent_dag_name: Option<&str>,
    parent_run_id: Option<&str>,
    root_dag_name: Option<&str>,
    root_run_id: Option<&str>,
    params: serde_json::Value,
    log_dir: &str,
    yaml_data: &str,
) -> Result<Option<Attempt>> {
    let result = sqlx::query_as::<_, Attempt>(
        "INSERT INTO attempts \
            (dag_namespace, dag_name, run_id, attempt_number, parent_dag_name, \
             parent_run_id, root_dag_name, root_run_id, status, queued_at, \
             params, node_states, log_dir, yaml_data) \
         VALUES ($1, $2, $3, \
            (SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM attempts WHERE dag_name = $2 AND run_id = $3), \
            $4, $5, $6, $7, 'queued', now(), $8, '[]'::jsonb, $9, $10) \
         ON CONFLICT (dag_name, run_id) WHERE status NOT IN \
            ('succeeded', 'failed', 'aborted', 'cancelled', 'partially_succeeded') \
         DO NOTHING \
         RETURNING *",
    )
    .bind(dag_namespace)
    .bind(dag_name)
    .bind(run_id)
    .bind(parent_dag_name)
    .bind(parent_run_id)
    .bind(root_dag_name)
    .bind(root_run_id)
    .bind(params)
    .bind(log_dir)
    .bind(yaml_data)
    .fetch_optional(pool)
    .await;

    match result {
        Ok(attempt) => Ok(attempt),
        // A second insert racing on the same (dag_name, run_id, attempt_number)
        // hits the table's full unique constraint instead of the partial
        // index above; treat it the same as "already exists".
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(None),
        Err(e) => Err(e).context("failed to insert attempt"),
    }
}

/// Create the next attempt (`attempt_number + 1`) for a retry, copying
/// params and yaml_data from the most recent terminal attempt. The caller
/// is responsible for verifying the previous attempt is terminal.
pub async fn create_retry_attempt(pool: &PgPool, previous: &Attempt) -> Result<Attempt> {
    let attempt = sqlx::query_as::<_, Attempt>(
        "INSERT INTO attempts \
            (dag_namespace, dag_name, run_id, attempt_number, parent_dag_name, \
             parent_run_id, root_dag_name, root_run_id, status, queued_at, \
             params, node_states, log_dir, yaml_data) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'queued', now(), $9, '[]'::jsonb, $10, $11) \
         RETURNING *",
    )
    .bind(&previous.dag_namespace)
    .bind(&previous.dag_name)
    .bind(&previous.run_id)
    .bind(previous.attempt_number + 1)
    .bind(&previous.parent_dag_name)
    .bind(&previous.parent_run_id)
    .bind(&previous.root_dag_name)
    .bind(&previous.root_run_id)
    .bind(&previous.params)
    .bind(&previous.log_dir)
    .bind(&previous.yaml_data)
    .fetch_one(pool)
    .await
    .context("failed to insert retry attempt")?;

    Ok(attempt)
}

/// Fetch the most recent (highest `attempt_number`) attempt for a `RunRef`.
pub async fn find_attempt(pool: &PgPool, dag_name: &str, run_id: &str) -> Result<Option<Attempt>> {
    let attempt = sqlx::query_as::<_, Attempt>(
        "SELECT * FROM attempts WHERE dag_name = $1 AND run_id = $2 \
         ORDER BY attempt_number DESC LIMIT 1",
    )
    .bind(dag_name)
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch attempt")?;

    Ok(attempt)
}

/// Fetch a single attempt by its row id.
pub async fn get_attempt(pool: &PgPool, id: Uuid) -> Result<Option<Attempt>> {
    let attempt = sqlx::query_as::<_, Attempt>("SELECT * FROM attempts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch attempt")?;

    Ok(attempt)
}

/// Optimistic-locked status transition: only applies if the row's current
/// status still matches `from`. Returns the number of rows affected (0
/// means the caller lost the race -- either `Busy`, if `from` is still
/// current by the time the caller re-checks, or `InvalidTransition` if the
/// row has already moved on to some other status).
pub async fn transition_attempt_status(
    pool: &PgPool,
    attempt_id: Uuid,
    from: AttemptStatus,
    to: AttemptStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE attempts \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             finished_at = COALESCE($3, finished_at) \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(finished_at)
    .bind(attempt_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition attempt status")?;

    Ok(result.rows_affected())
}

/// Append a history row recording a status change. Called after a
/// successful [`transition_attempt_status`] so the history table mirrors
/// the head status append-only, as required by the invariant that the
/// sequence of observed statuses is a prefix of a legal path.
pub async fn append_history(pool: &PgPool, attempt_id: Uuid, status: AttemptStatus) -> Result<()> {
    sqlx::query("INSERT INTO attempt_history (attempt_id, status) VALUES ($1, $2)")
        .bind(attempt_id)
        .bind(status)
        .execute(pool)
        .await
        .context("failed to append attempt history")?;

    Ok(())
}

/// List the full status history for an attempt, oldest first.
pub async fn list_history(pool: &PgPool, attempt_id: Uuid) -> Result<Vec<AttemptHistoryEntry>> {
    let rows = sqlx::query_as::<_, AttemptHistoryEntry>(
        "SELECT * FROM attempt_history WHERE attempt_id = $1 ORDER BY id ASC",
    )
    .bind(attempt_id)
    .fetch_all(pool)
    .await
    .context("failed to list attempt history")?;

    Ok(rows)
}

/// Overwrite the `node_states` column. Called by the Agent as steps
/// transition; not optimistic-locked since `node_states` is a side record
/// distinct from the authoritative `status` column (§4.1 concerns itself
/// with `status` serializability, not per-step bookkeeping).
pub async fn update_node_states(
    pool: &PgPool,
    attempt_id: Uuid,
    node_states: serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE attempts SET node_states = $1 WHERE id = $2")
        .bind(node_states)
        .bind(attempt_id)
        .execute(pool)
        .await
        .context("failed to update node states")?;

    Ok(())
}

/// Idempotent shortcut directly to `Failed`, used for early-failure
/// reporting before a run ever reaches `Running` (e.g. workspace setup
/// failure). A no-op if the attempt is already terminal.
pub async fn record_early_failure(pool: &PgPool, attempt_id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE attempts SET status = 'failed', finished_at = now() \
         WHERE id = $1 AND status NOT IN \
            ('succeeded', 'failed', 'aborted', 'cancelled', 'partially_succeeded')",
    )
    .bind(attempt_id)
    .execute(pool)
    .await
    .context("failed to record early failure")?;

    if result.rows_affected() > 0 {
        append_history(pool, attempt_id, AttemptStatus::Failed).await?;
    }

    Ok(())
}

/// List the most recent attempts for a DAG, newest first.
pub async fn list_recent(pool: &PgPool, dag_name: &str, limit: i64) -> Result<Vec<Attempt>> {
    let rows = sqlx::query_as::<_, Attempt>(
        "SELECT * FROM attempts WHERE dag_name = $1 \
         ORDER BY created_at DESC LIMIT $2",
    )
    .bind(dag_name)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent attempts")?;

    Ok(rows)
}

/// Count attempts currently `Running` for a DAG -- used by the scheduler
/// to enforce `maxActiveRuns`.
pub async fn count_running(pool: &PgPool, dag_name: &str) -> Result<i64> {
    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM attempts WHERE dag_name = $1 AND status = 'running'")
            .bind(dag_name)
            .fetch_one(pool)
            .await
            .context("failed to count running attempts")?;

    Ok(count.0)
}

/// Retention sweep: delete terminal attempts for a DAG older than
/// `older_than`. Never touches non-terminal attempts. With `dry_run` set,
/// returns the rows that would be deleted without deleting them.
pub async fn remove_old_dag_runs(
    pool: &PgPool,
    dag_name: &str,
    older_than: DateTime<Utc>,
    dry_run: bool,
) -> Result<Vec<Attempt>> {
    if dry_run {
        let rows = sqlx::query_as::<_, Attempt>(
            "SELECT * FROM attempts WHERE dag_name = $1 AND created_at < $2 \
             AND status IN ('succeeded', 'failed', 'aborted', 'cancelled', 'partially_succeeded')",
        )
        .bind(dag_name)
        .bind(older_than)
        .fetch_all(pool)
        .await
        .context("failed to preview retention sweep")?;
        return Ok(rows);
    }

    let rows = sqlx::query_as::<_, Attempt>(
        "DELETE FROM attempts WHERE dag_name = $1 AND created_at < $2 \
         AND status IN ('succeeded', 'failed', 'aborted', 'cancelled', 'partially_succeeded') \
         RETURNING *",
    )
    .bind(dag_name)
    .bind(older_than)
    .fetch_all(pool)
    .await
    .context("failed to run retention sweep")?;

    Ok(rows)
}
