//! gRPC Coordinator service: the broker workers dial to receive Tasks,
//! report progress, stream logs, and heartbeat over a control channel.
//!
//! No teacher or pack source exposes a full gRPC server implementation to
//! copy (`golem-api-grpc` contributes only its dependency table). The
//! waiter set and `Status` conversions are newly authored against
//! `tonic`'s server-side primitives directly, using the error mapping
//! style `pantsbuild-pants`'s remote-execution client reads `Code` back
//! out of (inverted here: typed error in, `Code` out). See
//! [`error::CoordinatorError`].

pub mod error;

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot, Mutex};
use tonic::{Request, Response, Status, Streaming};

use dagctl_proto::coordinator_server::Coordinator as GrpcCoordinator;
use dagctl_proto::{
    CancelAck, CancelDirective, CancelRequest, LogChunk, PollRequest, PollResponse, ReportAck,
    ReportRequest, RunRef as ProtoRunRef, ServerMsg, StreamLogsRequest, Task as ProtoTask,
    WorkerMsg,
};

use dagctl_db::models::{AttemptStatus, Priority};

use crate::attempt::StateMachine;
use crate::queue::QueueStore;
use crate::scheduler::{PendingTask, RemoteDispatch, SchedulerError};

pub use error::CoordinatorError;

/// Normalized worker labels, used as the waiter-set key. Two workers that
/// advertise the same label set land in the same bucket; dispatch still
/// has to scan buckets for a selector that is a subset, not an exact key
/// lookup.
type LabelSignature = Vec<String>;

fn signature(mut labels: Vec<String>) -> LabelSignature {
    labels.sort();
    labels.dedup();
    labels
}

fn selector_satisfied(selector: &HashMap<String, String>, labels: &[String]) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.iter().any(|l| l == &format!("{k}={v}")))
}

/// Shared state behind the Coordinator service. One instance per process;
/// cloned `Arc` handles are handed to `tonic::transport::Server`.
pub struct CoordinatorService {
    pool: PgPool,
    waiters: Mutex<HashMap<LabelSignature, VecDeque<oneshot::Sender<ProtoTask>>>>,
    pending: Mutex<VecDeque<PendingTask>>,
    control_senders: Arc<Mutex<HashMap<String, mpsc::Sender<Result<ServerMsg, Status>>>>>,
    run_owners: Arc<Mutex<HashMap<(String, String), String>>>,
    /// How long a worker's control stream may stay down before its
    /// non-terminal owned Attempts are declared worker-lost (§4.4).
    grace_period: Duration,
    default_poll_timeout: Duration,
}

impl CoordinatorService {
    pub fn new(pool: PgPool, default_poll_timeout: Duration) -> Arc<Self> {
        Self::with_grace_period(pool, default_poll_timeout, Duration::from_secs(30))
    }

    pub fn with_grace_period(pool: PgPool, default_poll_timeout: Duration, grace_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            pool,
            waiters: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            control_senders: Arc::new(Mutex::new(HashMap::new())),
            run_owners: Arc::new(Mutex::new(HashMap::new())),
            grace_period,
            default_poll_timeout,
        })
    }

    /// After `grace_period` with no reconnection, abort every non-terminal
    /// Attempt this worker held. A reconnect (its id reappearing in
    /// `control_senders`) within the window cancels the sweep; a terminal
    /// `Report` that lands during the window is respected too, since
    /// `StateMachine::write` only ever moves a row forward from `from`.
    async fn watch_for_worker_loss(
        pool: PgPool,
        control_senders: Arc<Mutex<HashMap<String, mpsc::Sender<Result<ServerMsg, Status>>>>>,
        run_owners: Arc<Mutex<HashMap<(String, String), String>>>,
        worker_id: String,
        grace_period: Duration,
    ) {
        tokio::time::sleep(grace_period).await;

        if control_senders.lock().await.contains_key(&worker_id) {
            return;
        }

        let owned: Vec<(String, String)> = {
            let mut owners = run_owners.lock().await;
            let mut found = Vec::new();
            owners.retain(|run_ref, owner| {
                if owner == &worker_id {
                    found.push(run_ref.clone());
                    false
                } else {
                    true
                }
            });
            found
        };

        let sm = StateMachine::new(&pool);
        for (dag_name, run_id) in owned {
            let Ok(attempt) = sm.find(&dag_name, &run_id).await else { continue };
            if attempt.status.is_terminal() {
                continue;
            }
            match sm.write(attempt.id, attempt.status, AttemptStatus::Aborted).await {
                Ok(()) => tracing::warn!(dag_name = %dag_name, run_id = %run_id, worker_id = %worker_id, "aborted run: worker-lost"),
                Err(e) => tracing::warn!(dag_name = %dag_name, run_id = %run_id, error = %e, "failed to abort run after worker-lost grace period"),
            }
        }
    }

    /// After forwarding a `CancelDirective`, force-abort the run if no
    /// terminal `Report` lands within `grace_period` -- a worker whose
    /// control stream stays up but which never acts on the directive
    /// would otherwise leave the attempt `Running` forever (§4.4). A
    /// `Report` that does land during the window moves the attempt on its
    /// own, so this becomes a no-op: `StateMachine::write` only applies
    /// when `from` still matches.
    async fn watch_for_cancel_grace(pool: PgPool, dag_name: String, run_id: String, grace_period: Duration) {
        tokio::time::sleep(grace_period).await;

        let sm = StateMachine::new(&pool);
        let Ok(attempt) = sm.find(&dag_name, &run_id).await else { return };
        if attempt.status.is_terminal() {
            return;
        }

        match sm.write(attempt.id, attempt.status, AttemptStatus::Aborted).await {
            Ok(()) => tracing::warn!(dag_name = %dag_name, run_id = %run_id, "aborted run: cancel grace period elapsed with no worker confirmation"),
            Err(e) => tracing::warn!(dag_name = %dag_name, run_id = %run_id, error = %e, "failed to force-abort run after cancel grace period"),
        }
    }

    fn encode_task(task: &PendingTask) -> ProtoTask {
        ProtoTask {
            run_ref: Some(ProtoRunRef {
                dag_name: task.dag_name.clone(),
                run_id: task.run_id.clone(),
            }),
            attempt_number: task.attempt_number as u32,
            yaml_data: task.yaml_data.clone(),
            params_json: task.params.to_string(),
            log_dir: task.log_dir.clone(),
        }
    }

    /// Try to hand `task` directly to a worker already blocked in `Poll`.
    /// Returns the task back if no waiter's labels satisfy the selector.
    async fn try_wake_waiter(&self, task: PendingTask) -> Option<PendingTask> {
        let mut waiters = self.waiters.lock().await;
        for (labels, queue) in waiters.iter_mut() {
            if !selector_satisfied(&task.worker_selector, labels) {
                continue;
            }
            while let Some(sender) = queue.pop_front() {
                let encoded = Self::encode_task(&task);
                if sender.send(encoded).is_ok() {
                    return None;
                }
                // Waiter's Poll call already returned (timeout/cancel race); try the next one.
            }
        }
        Some(task)
    }
}

#[async_trait]
impl RemoteDispatch for CoordinatorService {
    async fn publish_task(&self, task: PendingTask) -> Result<(), SchedulerError> {
        if let Some(task) = self.try_wake_waiter(task).await {
            self.pending.lock().await.push_back(task);
        }
        Ok(())
    }
}

type ServerMsgStream = Pin<Box<dyn Stream<Item = Result<ServerMsg, Status>> + Send + 'static>>;
type LogChunkStream = Pin<Box<dyn Stream<Item = Result<LogChunk, Status>> + Send + 'static>>;

#[async_trait]
impl GrpcCoordinator for CoordinatorService {
    type ControlStream = ServerMsgStream;
    type StreamLogsStream = LogChunkStream;

    /// Long-poll for a Task. A pending, already-published Task whose
    /// selector the caller's labels satisfy is returned immediately;
    /// otherwise the caller waits as a registered waiter until one
    /// arrives, `max_wait_ms` elapses, or the request is cancelled.
    async fn poll(&self, request: Request<PollRequest>) -> Result<Response<PollResponse>, Status> {
        let req = request.into_inner();
        let labels = signature(req.labels.clone());

        {
            let mut pending = self.pending.lock().await;
            if let Some(idx) = pending
                .iter()
                .position(|p| selector_satisfied(&p.worker_selector, &labels))
            {
                let entry = pending.remove(idx).expect("index just located");
                return Ok(Response::new(PollResponse { task: Some(Self::encode_task(&entry)) }));
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().await;
            waiters.entry(labels.clone()).or_default().push_back(tx);
        }

        let wait = if req.max_wait_ms > 0 {
            Duration::from_millis(req.max_wait_ms as u64)
        } else {
            self.default_poll_timeout
        };

        tokio::select! {
            task = rx => {
                match task {
                    Ok(task) => Ok(Response::new(PollResponse { task: Some(task) })),
                    Err(_) => Ok(Response::new(PollResponse { task: None })),
                }
            }
            _ = tokio::time::sleep(wait) => {
                // The registered `tx` is left in the waiter queue; a later
                // `publish_task` touching this label bucket will find the
                // send fails (receiver dropped with this call) and moves
                // on to the next waiter, lazily reclaiming it.
                Ok(Response::new(PollResponse { task: None }))
            }
        }
    }

    /// Apply a status/node-state report. Illegal or redundant transitions
    /// are discarded, not retried — `Report` is idempotent by virtue of
    /// the AttemptStore's optimistic-lock check, never by caller retry.
    async fn report(&self, request: Request<ReportRequest>) -> Result<Response<ReportAck>, Status> {
        let req = request.into_inner();
        let run_ref = req.run_ref.ok_or_else(|| Status::invalid_argument("run_ref is required"))?;

        let sm = StateMachine::new(&self.pool);
        let attempt = sm
            .find(&run_ref.dag_name, &run_ref.run_id)
            .await
            .map_err(CoordinatorError::from)?;

        self.run_owners
            .lock()
            .await
            .insert((run_ref.dag_name.clone(), run_ref.run_id.clone()), req.worker_id.clone());

        if req.rejected {
            // Worker had no free concurrency slot; revert to Queued and
            // requeue at High priority so the scheduler retries dispatch
            // promptly rather than waiting behind the original priority
            // class a second time.
            sm.write(attempt.id, attempt.status, AttemptStatus::Queued)
                .await
                .map_err(CoordinatorError::from)?;

            let dag = dagctl_db::queries::dags::get_dag_def(&self.pool, &attempt.dag_namespace, &attempt.dag_name)
                .await
                .map_err(CoordinatorError::Db)?
                .ok_or_else(|| Status::not_found("dag definition no longer registered"))?;

            QueueStore::new(&self.pool)
                .enqueue(&dag.queue_name, &run_ref.dag_name, &run_ref.run_id, Priority::High, None)
                .await
                .map_err(CoordinatorError::from)?;

            return Ok(Response::new(ReportAck { accepted: true }));
        }

        if !req.node_updates.is_empty() {
            let node_states: serde_json::Value = serde_json::to_value(
                req.node_updates
                    .iter()
                    .map(|u| {
                        serde_json::json!({
                            "step_name": u.step_name,
                            "status": u.status,
                            "exit_code": u.exit_code,
                        })
                    })
                    .collect::<Vec<_>>(),
            )
            .unwrap_or_default();
            sm.update_node_states(attempt.id, node_states)
                .await
                .map_err(CoordinatorError::from)?;
        }

        if let Some(status_str) = req.attempt_status {
            if let Ok(to) = status_str.parse() {
                match sm.write(attempt.id, attempt.status, to).await {
                    Ok(()) => {}
                    Err(e) => {
                        tracing::warn!(attempt_id = %attempt.id, error = %e, "discarding illegal report transition");
                    }
                }
            }
        }

        Ok(Response::new(ReportAck { accepted: true }))
    }

    /// Tail a run's log file from `tail_from_offset`. Log content itself
    /// is read directly off the filesystem by the caller's worker process,
    /// not reconstructed here; this endpoint is reserved for a future
    /// file-tailing implementation and currently returns an empty stream.
    async fn stream_logs(
        &self,
        _request: Request<StreamLogsRequest>,
    ) -> Result<Response<Self::StreamLogsStream>, Status> {
        let empty = futures::stream::empty::<Result<LogChunk, Status>>();
        Ok(Response::new(Box::pin(empty)))
    }

    /// Bidirectional heartbeat/report channel. The first message from a
    /// worker on a new stream establishes its `worker_id`'s control
    /// channel; subsequent `Cancel` directives for runs it holds are
    /// pushed back over the returned stream.
    async fn control(
        &self,
        request: Request<Streaming<WorkerMsg>>,
    ) -> Result<Response<Self::ControlStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<ServerMsg, Status>>(16);

        let senders = Arc::clone(&self.control_senders);
        let run_owners = Arc::clone(&self.run_owners);
        let pool = self.pool.clone();
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            let mut registered_worker_id: Option<String> = None;
            while let Ok(Some(msg)) = inbound.message().await {
                if let Some(dagctl_proto::coordinator::worker_msg::Payload::Heartbeat(hb)) = msg.payload {
                    if registered_worker_id.as_deref() != Some(hb.worker_id.as_str()) {
                        senders.lock().await.insert(hb.worker_id.clone(), tx.clone());
                        registered_worker_id = Some(hb.worker_id);
                    }
                }
            }
            if let Some(id) = registered_worker_id {
                senders.lock().await.remove(&id);
                tracing::warn!(worker_id = %id, "control stream closed, starting worker-lost grace period");
                tokio::spawn(Self::watch_for_worker_loss(pool, senders, run_owners, id, grace_period));
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    /// Administrative cancel: forward a `CancelDirective` to whichever
    /// worker's control stream currently owns the run, if any.
    async fn cancel(&self, request: Request<CancelRequest>) -> Result<Response<CancelAck>, Status> {
        let req = request.into_inner();
        let run_ref = req.run_ref.ok_or_else(|| Status::invalid_argument("run_ref is required"))?;

        let owner = self
            .run_owners
            .lock()
            .await
            .get(&(run_ref.dag_name.clone(), run_ref.run_id.clone()))
            .cloned();

        let Some(worker_id) = owner else {
            return Ok(Response::new(CancelAck { accepted: false }));
        };

        let sender = self.control_senders.lock().await.get(&worker_id).cloned();
        let Some(sender) = sender else {
            return Ok(Response::new(CancelAck { accepted: false }));
        };

        let dag_name = run_ref.dag_name.clone();
        let run_id = run_ref.run_id.clone();
        let directive = ServerMsg {
            payload: Some(dagctl_proto::coordinator::server_msg::Payload::Cancel(CancelDirective {
                run_ref: Some(run_ref),
            })),
        };

        let accepted = sender.send(Ok(directive)).await.is_ok();
        if accepted {
            tokio::spawn(Self::watch_for_cancel_grace(self.pool.clone(), dag_name, run_id, self.grace_period));
        }

        Ok(Response::new(CancelAck { accepted }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_normalizes_order_and_duplicates() {
        let a = signature(vec!["gpu=true".into(), "zone=us".into()]);
        let b = signature(vec!["zone=us".into(), "gpu=true".into(), "zone=us".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn selector_satisfied_requires_every_key() {
        let mut selector = HashMap::new();
        selector.insert("gpu".to_string(), "true".to_string());
        selector.insert("zone".to_string(), "us".to_string());

        assert!(!selector_satisfied(&selector, &["gpu=true".to_string()]));
        assert!(selector_satisfied(&selector, &["gpu=true".to_string(), "zone=us".to_string(), "arch=x86".to_string()]));
    }

    #[test]
    fn empty_selector_is_satisfied_by_any_labels() {
        assert!(selector_satisfied(&HashMap::new(), &[]));
        assert!(selector_satisfied(&HashMap::new(), &["gpu=true".to_string()]));
    }
}
