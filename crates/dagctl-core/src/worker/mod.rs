//! Worker: dials the Coordinator, long-polls for Tasks, executes them
//! locally via the [`crate::agent::Agent`], and reports results back.
//!
//! The reconnect-with-backoff loop generalizes
//! `gator-core/src/harness/claude_code.rs`'s `Arc<Mutex<HashMap<...>>>`
//! process-table bookkeeping (here keyed by `RunRef` instead of OS pid),
//! and the bounded-concurrency slot is a `tokio::sync::Semaphore` exactly
//! as `OrchestratorConfig::max_agents` gates `run_orchestrator`'s spawn
//! loop.

pub mod error;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use dagctl_proto::coordinator_client::CoordinatorClient;
use dagctl_proto::{Heartbeat, NodeUpdate, PollRequest, ReportRequest, WorkerMsg};

use crate::agent::{Agent, AgentError};
use crate::dag::DagDef;

pub use error::WorkerError;

type RunKey = (String, String);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub coordinator_addr: String,
    pub worker_id: String,
    pub labels: Vec<String>,
    pub max_concurrent: usize,
    pub poll_timeout: Duration,
    pub grace_period: Duration,
    pub log_root: PathBuf,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: "http://127.0.0.1:7800".to_string(),
            worker_id: "worker".to_string(),
            labels: Vec::new(),
            max_concurrent: 4,
            poll_timeout: Duration::from_secs(20),
            grace_period: Duration::from_secs(5),
            log_root: PathBuf::from("./data/worker-logs"),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Dial the coordinator, retrying with jittered exponential backoff
/// (base 1s, cap 30s) until it succeeds or `cancel` fires.
async fn dial_with_backoff(
    config: &WorkerConfig,
    cancel: &CancellationToken,
) -> Result<Option<CoordinatorClient<Channel>>, WorkerError> {
    let endpoint = Endpoint::from_shared(config.coordinator_addr.clone()).map_err(|source| {
        WorkerError::Connect { addr: config.coordinator_addr.clone(), source }
    })?;

    let mut delay = config.backoff_base;

    loop {
        match endpoint.clone().connect().await {
            Ok(channel) => return Ok(Some(CoordinatorClient::new(channel))),
            Err(e) => {
                tracing::warn!(addr = %config.coordinator_addr, error = %e, delay_ms = delay.as_millis(), "coordinator dial failed, backing off");
            }
        }

        let jitter = Duration::from_millis(rand::rng().random_range(0..=250));
        tokio::select! {
            _ = tokio::time::sleep(delay + jitter) => {}
            _ = cancel.cancelled() => return Ok(None),
        }

        delay = (delay * 2).min(config.backoff_cap);
    }
}

/// Main worker loop. Runs until `cancel` fires, at which point in-flight
/// tasks are signalled to shut down and the loop returns once they drain.
pub async fn run(config: WorkerConfig, cancel: CancellationToken) -> Result<(), WorkerError> {
    let Some(mut client) = dial_with_backoff(&config, &cancel).await? else {
        return Ok(());
    };

    let active: Arc<Mutex<HashMap<RunKey, CancellationToken>>> = Arc::new(Mutex::new(HashMap::new()));
    spawn_control_loop(client.clone(), config.worker_id.clone(), Arc::clone(&active));

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent));

    loop {
        if cancel.is_cancelled() {
            tracing::info!("worker shutting down, draining in-flight tasks");
            let _ = semaphore.acquire_many(config.max_concurrent as u32).await;
            return Ok(());
        }

        let response = client
            .poll(Request::new(PollRequest {
                worker_id: config.worker_id.clone(),
                labels: config.labels.clone(),
                poller_id: config.worker_id.clone(),
                max_wait_ms: config.poll_timeout.as_millis() as u32,
            }))
            .await;

        let task = match response {
            Ok(resp) => resp.into_inner().task,
            Err(status) => {
                tracing::warn!(error = %status, "poll failed, retrying");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let Some(task) = task else { continue };

        let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
            let Some(run_ref) = task.run_ref.clone() else { continue };
            let _ = client
                .report(Request::new(ReportRequest {
                    worker_id: config.worker_id.clone(),
                    run_ref: Some(run_ref),
                    node_updates: vec![],
                    attempt_status: None,
                    rejected: true,
                }))
                .await;
            continue;
        };

        let client_for_task = client.clone();
        let active = Arc::clone(&active);
        let worker_id = config.worker_id.clone();
        let grace_period = config.grace_period;
        let log_root = config.log_root.clone();

        tokio::spawn(async move {
            execute_task(client_for_task, worker_id, task, active, grace_period, log_root, permit).await;
        });
    }
}

/// Opens the bidi Control stream: sends a heartbeat on an interval and
/// forwards `Cancel` directives to the matching run's token, if still
/// active.
fn spawn_control_loop(
    mut client: CoordinatorClient<Channel>,
    worker_id: String,
    active: Arc<Mutex<HashMap<RunKey, CancellationToken>>>,
) {
    tokio::spawn(async move {
        let (tx, rx) = mpsc::channel::<WorkerMsg>(8);
        let heartbeat_worker_id = worker_id.clone();
        tokio::spawn(async move {
            loop {
                let msg = WorkerMsg {
                    payload: Some(dagctl_proto::coordinator::worker_msg::Payload::Heartbeat(Heartbeat {
                        worker_id: heartbeat_worker_id.clone(),
                    })),
                };
                if tx.send(msg).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        });

        let outbound = tokio_stream::wrappers::ReceiverStream::new(rx);
        let response = match client.control(Request::new(outbound)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "control stream failed to open");
                return;
            }
        };

        let mut inbound = response.into_inner();
        while let Ok(Some(msg)) = inbound.message().await {
            if let Some(dagctl_proto::coordinator::server_msg::Payload::Cancel(directive)) = msg.payload {
                if let Some(run_ref) = directive.run_ref {
                    let key = (run_ref.dag_name, run_ref.run_id);
                    if let Some(token) = active.lock().await.get(&key) {
                        token.cancel();
                    }
                }
            }
        }
    });
}

async fn execute_task(
    mut client: CoordinatorClient<Channel>,
    worker_id: String,
    task: dagctl_proto::Task,
    active: Arc<Mutex<HashMap<RunKey, CancellationToken>>>,
    grace_period: Duration,
    log_root: PathBuf,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    let Some(run_ref) = task.run_ref.clone() else { return };
    let key = (run_ref.dag_name.clone(), run_ref.run_id.clone());
    let token = CancellationToken::new();
    active.lock().await.insert(key.clone(), token.clone());

    let result = run_one(task.clone(), grace_period, &log_root, token).await;
    active.lock().await.remove(&key);
    drop(permit);

    let (status, node_updates) = match result {
        Ok((status, states)) => (
            status.to_string(),
            states
                .into_iter()
                .map(|s| NodeUpdate {
                    step_name: s.step_name,
                    status: s.status.to_string(),
                    exit_code: s.exit_code,
                })
                .collect(),
        ),
        Err(e) => {
            tracing::error!(dag_name = %run_ref.dag_name, run_id = %run_ref.run_id, error = %e, "task execution failed");
            ("failed".to_string(), vec![])
        }
    };

    let _ = client
        .report(Request::new(ReportRequest {
            worker_id,
            run_ref: Some(run_ref),
            node_updates,
            attempt_status: Some(status),
            rejected: false,
        }))
        .await;
}

async fn run_one(
    task: dagctl_proto::Task,
    grace_period: Duration,
    log_root: &std::path::Path,
    cancel: CancellationToken,
) -> Result<(dagctl_db::models::AttemptStatus, Vec<dagctl_db::models::NodeState>), WorkerError> {
    let dag = DagDef::from_yaml(&task.yaml_data)?;
    let run_ref = task.run_ref.as_ref().expect("run_ref checked by caller");
    let log_dir = log_root.join(&run_ref.dag_name).join(&run_ref.run_id).join(format!("attempt-{}", task.attempt_number));
    tokio::fs::create_dir_all(&log_dir)
        .await
        .map_err(|e| WorkerError::Agent(AgentError::Io(e)))?;

    let env: HashMap<String, String> = std::env::vars().collect();
    // A worker has no database connectivity (it only ever talks to the
    // Coordinator over gRPC), so this agent runs with no run context --
    // `SubDag` steps and `handler_on` dispatch surface as NotExecutable
    // rather than recursing; see `agent::run_subdag`.
    let agent = Agent::new(grace_period);
    Ok(agent.run(&dag, &env, &log_dir, cancel, None).await?)
}
