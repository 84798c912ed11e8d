use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use dagctl_core::dag::DagDef;
use dagctl_core::queue::QueueStore;
use dagctl_db::models::Priority;
use dagctl_db::queries::dags;

/// Load a DAG definition from `path`, register it, and create a Queued
/// attempt + queue entry for it. Shared by `enqueue`/`start`/`dry`, which
/// differ only in priority and what happens after admission.
pub async fn register_and_create_attempt(
    pool: &PgPool,
    path: &str,
    run_id: Option<&str>,
    params: Option<&str>,
) -> Result<(dagctl_db::models::DagDef, dagctl_db::models::Attempt)> {
    let yaml_source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read DAG file at {path}"))?;
    let dag = DagDef::from_yaml(&yaml_source).context("DAG failed validation")?;

    let dag_row = dags::upsert_dag_def(
        pool,
        &dag.namespace,
        &dag.name,
        &dag.queue_name,
        dag.max_active_runs as i32,
        dag.max_active_steps as i32,
        serde_json::to_value(&dag.worker_selector).unwrap_or_default(),
        &yaml_source,
    )
    .await
    .context("failed to register DAG")?;

    let run_id = run_id.map(str::to_string).unwrap_or_else(|| Uuid::new_v4().to_string());
    let params = match params {
        Some(raw) => serde_json::from_str(raw).context("--params must be valid JSON")?,
        None => dag.params.clone(),
    };
    let log_dir = data_dir()
        .join(&dag.namespace)
        .join(&dag.name)
        .join(&run_id)
        .join("attempt-1");

    let attempt_sm = dagctl_core::attempt::StateMachine::new(pool);
    let attempt = attempt_sm
        .create(
            &dag.namespace,
            &dag.name,
            &run_id,
            None,
            None,
            params,
            &log_dir.to_string_lossy(),
            &yaml_source,
        )
        .await
        .context("failed to create attempt (a non-terminal attempt for this ref may already exist)")?;

    Ok((dag_row, attempt))
}

/// Root directory for per-attempt log directories. `DAGCTL_DATA_DIR`
/// overrides the default, matching `SchedulerConfig::data_dir`.
pub fn data_dir() -> std::path::PathBuf {
    std::env::var("DAGCTL_DATA_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("./data"))
}

pub async fn run(pool: &PgPool, path: &str, run_id: Option<&str>, params: Option<&str>) -> Result<()> {
    let (dag_row, attempt) = register_and_create_attempt(pool, path, run_id, params).await?;

    QueueStore::new(pool)
        .enqueue(&dag_row.queue_name, &attempt.dag_name, &attempt.run_id, Priority::Low, None)
        .await
        .context("failed to enqueue attempt")?;

    println!("Enqueued {}/{} (attempt {})", attempt.dag_name, attempt.run_id, attempt.attempt_number);
    Ok(())
}
