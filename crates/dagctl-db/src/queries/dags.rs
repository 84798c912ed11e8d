//! Database query functions for the `dag_defs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::DagDef;

/// Register or update a DAG definition. `namespace`+`name` is unique;
/// re-registering replaces the queue/limits/selector/source in place, since
/// in-flight attempts already carry their own immutable `yaml_data` snapshot.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_dag_def(
    pool: &PgPool,
    namespace: &str,
    name: &str,
    queue_name: &str,
    max_active_runs: i32,
    max_active_steps: i32,
    worker_selector: serde_json::Value,
    yaml_source: &str,
) -> Result<DagDef> {
    let dag = sqlx::query_as::<_, DagDef>(
        "INSERT INTO dag_defs \
            (namespace, name, queue_name, max_active_runs, max_active_steps, worker_selector, yaml_source) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (namespace, name) DO UPDATE SET \
            queue_name = EXCLUDED.queue_name, \
            max_active_runs = EXCLUDED.max_active_runs, \
            max_active_steps = EXCLUDED.max_active_steps, \
            worker_selector = EXCLUDED.worker_selector, \
            yaml_source = EXCLUDED.yaml_source \
         RETURNING *",
    )
    .bind(namespace)
    .bind(name)
    .bind(queue_name)
    .bind(max_active_runs)
    .bind(max_active_steps)
    .bind(worker_selector)
    .bind(yaml_source)
    .fetch_one(pool)
    .await
    .context("failed to upsert dag definition")?;

    Ok(dag)
}

/// Fetch a DAG definition by namespace + name.
pub async fn get_dag_def(pool: &PgPool, namespace: &str, name: &str) -> Result<Option<DagDef>> {
    let dag = sqlx::query_as::<_, DagDef>(
        "SELECT * FROM dag_defs WHERE namespace = $1 AND name = $2",
    )
    .bind(namespace)
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("failed to fetch dag definition")?;

    Ok(dag)
}

/// Fetch a DAG definition by its row id.
pub async fn get_dag_def_by_id(pool: &PgPool, id: Uuid) -> Result<Option<DagDef>> {
    let dag = sqlx::query_as::<_, DagDef>("SELECT * FROM dag_defs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch dag definition")?;

    Ok(dag)
}

/// List all registered DAG definitions, ordered by name.
pub async fn list_dag_defs(pool: &PgPool) -> Result<Vec<DagDef>> {
    let dags = sqlx::query_as::<_, DagDef>("SELECT * FROM dag_defs ORDER BY namespace, name")
        .fetch_all(pool)
        .await
        .context("failed to list dag definitions")?;

    Ok(dags)
}
