use anyhow::{Context, Result};
use sqlx::PgPool;

use dagctl_core::attempt::StateMachine;
use dagctl_core::dag::topological_order;
use dagctl_db::models::{AttemptStatus, NodeState, StepStatus};

use crate::enqueue_cmd::register_and_create_attempt;

/// `dagctl dry`: validate a DAG and simulate a run with no subprocesses.
/// Writes a Succeeded attempt whose node_states mark every step succeeded
/// in topological order, without running anything.
pub async fn run(pool: &PgPool, path: &str) -> Result<()> {
    let (_, attempt) = register_and_create_attempt(pool, path, None, None).await?;

    let yaml_source = std::fs::read_to_string(path).with_context(|| format!("failed to re-read {path}"))?;
    let dag = dagctl_core::dag::DagDef::from_yaml(&yaml_source)?;
    let order = topological_order(&dag.steps)?;

    let node_states: Vec<NodeState> = order
        .into_iter()
        .map(|step| NodeState {
            step_name: step.name.clone(),
            status: StepStatus::Succeeded,
            attempts: 1,
            exit_code: Some(0),
            stdout_path: None,
            stderr_path: None,
        })
        .collect();

    let attempt_sm = StateMachine::new(pool);
    attempt_sm
        .update_node_states(attempt.id, serde_json::to_value(&node_states).unwrap_or_default())
        .await?;
    attempt_sm.write(attempt.id, AttemptStatus::Queued, AttemptStatus::Running).await?;
    attempt_sm.write(attempt.id, AttemptStatus::Running, AttemptStatus::Succeeded).await?;

    println!("Dry run of {}/{} succeeded ({} steps simulated)", attempt.dag_name, attempt.run_id, node_states.len());
    Ok(())
}
