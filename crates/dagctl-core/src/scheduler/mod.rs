//! Queue drainer: admits Queued attempts to Running and dispatches them
//! either to a local [`crate::agent::Agent`] or to the Coordinator's
//! pending-task set for remote workers.
//!
//! Generalizes `run_orchestrator`'s main loop: the semaphore-gated
//! spawn-or-wait structure (acquire permit, spawn, `mpsc::channel` back to
//! the loop, `tokio::select!` between `rx.recv()` and the cancellation
//! token, a short sleep when nothing is in flight) carries over directly,
//! replacing "spawn an agent lifecycle task" with "decide local-vs-remote
//! dispatch."

pub mod error;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dagctl_db::models::{Attempt, AttemptStatus, QueueEntry};

use crate::agent::Agent;
use crate::attempt::StateMachine;
use crate::dag::{preconditions_satisfied, DagDef};
use crate::queue::QueueStore;

pub use error::SchedulerError;

/// A Task ready to be claimed by a worker whose labels satisfy
/// `worker_selector`. Published to the Coordinator's waiter set when the
/// DAG declares a non-empty selector.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub attempt_id: Uuid,
    pub dag_name: String,
    pub run_id: String,
    pub attempt_number: i32,
    pub worker_selector: HashMap<String, String>,
    pub yaml_data: String,
    pub params: serde_json::Value,
    pub log_dir: String,
}

/// Implemented by the Coordinator service; lets the scheduler publish a
/// dispatched Task without depending on `dagctl-proto` or the gRPC
/// transport directly.
#[async_trait]
pub trait RemoteDispatch: Send + Sync {
    async fn publish_task(&self, task: PendingTask) -> Result<(), SchedulerError>;
}

/// A no-op dispatcher for single-node deployments with no remote workers.
pub struct NoRemoteWorkers;

#[async_trait]
impl RemoteDispatch for NoRemoteWorkers {
    async fn publish_task(&self, task: PendingTask) -> Result<(), SchedulerError> {
        tracing::error!(
            dag_name = %task.dag_name,
            run_id = %task.run_id,
            "task requires remote dispatch but no coordinator is configured"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub max_local_agents: usize,
    pub grace_period: Duration,
    pub data_dir: PathBuf,
}

struct LocalRunDone {
    attempt_id: Uuid,
    dag_name: String,
    run_id: String,
    result: anyhow::Result<(AttemptStatus, Vec<dagctl_db::models::NodeState>)>,
}

pub struct Scheduler {
    pool: PgPool,
    dispatcher: Arc<dyn RemoteDispatch>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(pool: PgPool, dispatcher: Arc<dyn RemoteDispatch>, config: SchedulerConfig) -> Self {
        Self { pool, dispatcher, config }
    }

    /// Drain every admissible queued entry once. Called by [`Self::run`]'s
    /// tick loop and exposed standalone for `dagctl scheduler --once`/tests.
    pub async fn tick(&self, wake: &mpsc::Sender<LocalRunDone>, semaphore: &Arc<Semaphore>) -> Result<(), SchedulerError> {
        let dags = dagctl_db::queries::dags::list_dag_defs(&self.pool)
            .await
            .map_err(SchedulerError::Db)?;

        for dag_row in dags {
            let queue = QueueStore::new(&self.pool);
            let attempt_sm = StateMachine::new(&self.pool);
            let mut running = attempt_sm.count_running(&dag_row.name).await?;
            let max_active = dag_row.max_active_runs;

            loop {
                if max_active > 0 && running >= max_active as i64 {
                    break;
                }

                let dag_name = dag_row.name.clone();
                let entry = queue
                    .next_admissible(&dag_name, |_entry: &QueueEntry| true)
                    .await?;

                let Some(entry) = entry else { break };

                let dag = match DagDef::from_yaml(&dag_row.yaml_source) {
                    Ok(dag) => dag,
                    Err(e) => {
                        tracing::error!(dag_name = %dag_row.name, error = %e, "dag failed validation, skipping dispatch");
                        break;
                    }
                };

                if !preconditions_satisfied(&dag.preconditions).await {
                    // PreconditionFailed: leave Queued, re-evaluate next tick.
                    break;
                }

                self.admit_and_dispatch(&entry, &dag, wake, semaphore).await?;
                // `admit_and_dispatch` just wrote this attempt Queued -> Running;
                // account for it immediately so the cap holds within this tick,
                // not just across ticks.
                running += 1;
            }
        }

        Ok(())
    }

    async fn admit_and_dispatch(
        &self,
        entry: &QueueEntry,
        dag: &DagDef,
        wake: &mpsc::Sender<LocalRunDone>,
        semaphore: &Arc<Semaphore>,
    ) -> Result<(), SchedulerError> {
        let attempt_sm = StateMachine::new(&self.pool);
        let attempt = attempt_sm.find(&entry.dag_name, &entry.run_id).await?;

        attempt_sm
            .write(attempt.id, AttemptStatus::Queued, AttemptStatus::Running)
            .await?;

        let queue = QueueStore::new(&self.pool);
        if let Err(e) = queue.dequeue_by_run_id(&entry.dag_name, &entry.run_id).await {
            tracing::warn!(dag_name = %entry.dag_name, run_id = %entry.run_id, error = %e, "queue entry vanished after admission");
        }

        if dag.worker_selector.is_empty() {
            self.dispatch_local(attempt, dag.clone(), wake, semaphore).await;
        } else {
            self.dispatch_remote(attempt, dag).await?;
        }

        Ok(())
    }

    async fn dispatch_local(
        &self,
        attempt: Attempt,
        dag: DagDef,
        wake: &mpsc::Sender<LocalRunDone>,
        semaphore: &Arc<Semaphore>,
    ) {
        let Ok(permit) = Arc::clone(semaphore).acquire_owned().await else { return };

        let wake = wake.clone();
        let grace_period = self.config.grace_period;
        let log_dir = PathBuf::from(&attempt.log_dir);
        let attempt_id = attempt.id;
        let dag_name = attempt.dag_name.clone();
        let run_id = attempt.run_id.clone();
        let pool = self.pool.clone();
        let ctx = crate::agent::RunContext {
            attempt_id: attempt.id,
            namespace: attempt.dag_namespace.clone(),
            dag_name: attempt.dag_name.clone(),
            run_id: attempt.run_id.clone(),
        };

        tokio::spawn(async move {
            let agent = Agent::with_pool(grace_period, pool);
            let env: HashMap<String, String> = std::env::vars().collect();
            let result = agent
                .run(&dag, &env, &log_dir, CancellationToken::new(), Some(&ctx))
                .await
                .map_err(anyhow::Error::from);

            drop(permit);
            let _ = wake
                .send(LocalRunDone { attempt_id, dag_name, run_id, result })
                .await;
        });
    }

    async fn dispatch_remote(&self, attempt: Attempt, dag: DagDef) -> Result<(), SchedulerError> {
        self.dispatcher
            .publish_task(PendingTask {
                attempt_id: attempt.id,
                dag_name: attempt.dag_name,
                run_id: attempt.run_id,
                attempt_number: attempt.attempt_number,
                worker_selector: dag.worker_selector,
                yaml_data: attempt.yaml_data,
                params: attempt.params,
                log_dir: attempt.log_dir,
            })
            .await
    }

    async fn handle_local_result(&self, done: LocalRunDone) -> Result<(), SchedulerError> {
        let attempt_sm = StateMachine::new(&self.pool);

        match done.result {
            Ok((status, node_states)) => {
                attempt_sm
                    .update_node_states(done.attempt_id, serde_json::to_value(node_states).unwrap_or_default())
                    .await?;
                attempt_sm.write(done.attempt_id, AttemptStatus::Running, status).await?;
            }
            Err(e) => {
                tracing::error!(
                    dag_name = %done.dag_name,
                    run_id = %done.run_id,
                    error = %e,
                    "local run failed with an execution error"
                );
                attempt_sm.record_early_failure(done.attempt_id).await?;
            }
        }

        Ok(())
    }

    /// Startup recovery: any attempt left `Running` from a crashed previous
    /// process (no in-memory Agent task can own it after a restart) is
    /// failed outright. Mirrors `run_orchestrator`'s orphaned-task reset at
    /// the top of its main loop.
    pub async fn recover_orphaned(&self) -> Result<(), SchedulerError> {
        let dags = dagctl_db::queries::dags::list_dag_defs(&self.pool)
            .await
            .map_err(SchedulerError::Db)?;

        for dag in dags {
            let recent = dagctl_db::queries::attempts::list_recent(&self.pool, &dag.name, 100)
                .await
                .map_err(SchedulerError::Db)?;

            for attempt in recent.into_iter().filter(|a| a.status == AttemptStatus::Running) {
                tracing::warn!(attempt_id = %attempt.id, dag_name = %attempt.dag_name, "resetting orphaned running attempt to failed on startup");
                StateMachine::new(&self.pool).record_early_failure(attempt.id).await?;
            }
        }

        Ok(())
    }

    /// Main loop: tick on an interval, draining admissible queue entries,
    /// until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        self.recover_orphaned().await?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_local_agents));
        let (tx, mut rx) = mpsc::channel::<LocalRunDone>(self.config.max_local_agents * 2 + 1);

        loop {
            if cancel.is_cancelled() {
                tracing::info!("scheduler cancelled, draining in-flight local runs");
                while let Ok(done) = rx.try_recv() {
                    self.handle_local_result(done).await?;
                }
                return Ok(());
            }

            while let Ok(done) = rx.try_recv() {
                self.handle_local_result(done).await?;
            }

            self.tick(&tx, &semaphore).await?;

            tokio::select! {
                done = rx.recv() => {
                    if let Some(done) = done {
                        self.handle_local_result(done).await?;
                    }
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}
