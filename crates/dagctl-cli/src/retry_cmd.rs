use anyhow::{bail, Context, Result};
use sqlx::PgPool;

use dagctl_core::attempt::StateMachine;
use dagctl_core::queue::QueueStore;
use dagctl_db::models::Priority;
use dagctl_db::queries::dags;

/// `dagctl retry`: create attempt_number + 1 from a terminal attempt,
/// inheriting its params and yaml_data, and re-enqueue it.
pub async fn run(pool: &PgPool, dag_name: &str, run_id: &str) -> Result<()> {
    let attempt_sm = StateMachine::new(pool);
    let previous = attempt_sm.find(dag_name, run_id).await?;

    if !previous.status.is_terminal() {
        bail!("attempt {dag_name}/{run_id} is {}, not terminal", previous.status);
    }

    let retried = attempt_sm.retry(&previous).await.context("failed to create retry attempt")?;

    let dag_row = dags::get_dag_def(pool, &retried.dag_namespace, &retried.dag_name)
        .await
        .context("failed to look up dag definition")?
        .with_context(|| format!("dag {dag_name} is no longer registered"))?;

    QueueStore::new(pool)
        .enqueue(&dag_row.queue_name, &retried.dag_name, &retried.run_id, Priority::High, None)
        .await
        .context("failed to enqueue retry attempt")?;

    println!("Retrying {dag_name}/{run_id} as attempt {}", retried.attempt_number);
    Ok(())
}
