use anyhow::{bail, Context, Result};
use sqlx::PgPool;

use dagctl_core::attempt::StateMachine;
use dagctl_core::queue::QueueStore;
use dagctl_db::models::AttemptStatus;

/// `dagctl dequeue --workflow=<dag_name>:<run_id>`: Queued -> Cancelled,
/// removes the matching queue entry.
pub async fn run(pool: &PgPool, workflow: &str) -> Result<()> {
    let (dag_name, run_id) = workflow
        .split_once(':')
        .with_context(|| format!("--workflow must be \"<dag_name>:<run_id>\", got {workflow:?}"))?;

    let attempt_sm = StateMachine::new(pool);
    let attempt = attempt_sm.find(dag_name, run_id).await?;

    if attempt.status != AttemptStatus::Queued {
        bail!("attempt {dag_name}/{run_id} is {}, not queued", attempt.status);
    }

    attempt_sm
        .write(attempt.id, AttemptStatus::Queued, AttemptStatus::Cancelled)
        .await
        .context("failed to cancel queued attempt")?;

    QueueStore::new(pool)
        .dequeue_by_run_id(dag_name, run_id)
        .await
        .context("failed to remove queue entry")?;

    println!("Dequeued {dag_name}/{run_id}");
    Ok(())
}
