//! Database query functions for the `queue_entries` table.
//!
//! A queue entry exists iff its attempt's status is `Queued` (§4.1/§4.2
//! invariant 2). Callers are responsible for keeping the two in lockstep:
//! [`enqueue`] is called right after `create_attempt`, and
//! [`dequeue_by_run_id`] right before the corresponding status write to
//! `Cancelled`/`Running`.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{Priority, QueueEntry};

/// Insert a queue entry. A duplicate `(queue_name, dag_name, run_id)` is a
/// no-op (`ON CONFLICT DO NOTHING`), matching the spec's "duplicate enqueue
/// of identical ref is a no-op" rule.
pub async fn enqueue(
    pool: &PgPool,
    queue_name: &str,
    dag_name: &str,
    run_id: &str,
    priority: Priority,
) -> Result<Option<QueueEntry>> {
    let entry = sqlx::query_as::<_, QueueEntry>(
        "INSERT INTO queue_entries (queue_name, dag_name, run_id, priority, enqueued_at) \
         VALUES ($1, $2, $3, $4, now()) \
         ON CONFLICT (dag_name, run_id) DO NOTHING \
         RETURNING *",
    )
    .bind(queue_name)
    .bind(dag_name)
    .bind(run_id)
    .bind(priority)
    .fetch_optional(pool)
    .await
    .context("failed to enqueue")?;

    Ok(entry)
}

/// Remove the queue entry for a `RunRef`. Returns the removed row, or
/// `None` if no such entry exists.
pub async fn dequeue_by_run_id(
    pool: &PgPool,
    dag_name: &str,
    run_id: &str,
) -> Result<Option<QueueEntry>> {
    let entry = sqlx::query_as::<_, QueueEntry>(
        "DELETE FROM queue_entries WHERE dag_name = $1 AND run_id = $2 RETURNING *",
    )
    .bind(dag_name)
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("failed to dequeue")?;

    Ok(entry)
}

/// Current depth of a named queue, used to enforce capacity limits.
pub async fn queue_depth(pool: &PgPool, queue_name: &str) -> Result<i64> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_entries WHERE queue_name = $1")
        .bind(queue_name)
        .fetch_one(pool)
        .await
        .context("failed to compute queue depth")?;

    Ok(count.0)
}

/// Peek at the next `n` entries for a DAG in dispatch order (High before
/// Low, FIFO by `enqueued_at` within a priority class).
pub async fn peek(pool: &PgPool, dag_name: &str, n: i64) -> Result<Vec<QueueEntry>> {
    let rows = sqlx::query_as::<_, QueueEntry>(
        "SELECT * FROM queue_entries WHERE dag_name = $1 \
         ORDER BY (priority = 'high') DESC, enqueued_at ASC LIMIT $2",
    )
    .bind(dag_name)
    .bind(n)
    .fetch_all(pool)
    .await
    .context("failed to peek queue entries")?;

    Ok(rows)
}

/// List every queue entry for a DAG in dispatch order.
pub async fn list(pool: &PgPool, dag_name: &str) -> Result<Vec<QueueEntry>> {
    let rows = sqlx::query_as::<_, QueueEntry>(
        "SELECT * FROM queue_entries WHERE dag_name = $1 \
         ORDER BY (priority = 'high') DESC, enqueued_at ASC",
    )
    .bind(dag_name)
    .fetch_all(pool)
    .await
    .context("failed to list queue entries")?;

    Ok(rows)
}
