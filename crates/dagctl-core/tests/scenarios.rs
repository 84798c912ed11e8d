//! End-to-end scenarios against a real database and a real local Agent,
//! one `#[tokio::test]` per scenario. No subprocess or gRPC transport
//! mocking except where a scenario is specifically about the wire (label
//! routing, worker loss), which spin up a real in-process server.

use std::sync::Arc;
use std::time::Duration;

use dagctl_core::attempt::StateMachine;
use dagctl_core::coordinator::CoordinatorService;
use dagctl_core::dag::DagDef;
use dagctl_core::queue::QueueStore;
use dagctl_core::scheduler::{NoRemoteWorkers, RemoteDispatch, Scheduler, SchedulerConfig};
use dagctl_db::models::{AttemptStatus, Priority};
use dagctl_test_utils::{create_test_db, drop_test_db};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

async fn register(
    pool: &sqlx::PgPool,
    name: &str,
    max_active_runs: i32,
    worker_selector: serde_json::Value,
    yaml: &str,
) -> dagctl_db::models::DagDef {
    dagctl_db::queries::dags::upsert_dag_def(pool, "default", name, "default", max_active_runs, 4, worker_selector, yaml)
        .await
        .expect("dag registration should succeed")
}

async fn enqueue_run(
    pool: &sqlx::PgPool,
    dag_row: &dagctl_db::models::DagDef,
    run_id: &str,
    priority: Priority,
    params: serde_json::Value,
    data_dir: &std::path::Path,
) -> dagctl_db::models::Attempt {
    let log_dir = data_dir.join(&dag_row.name).join(run_id);
    let attempt = StateMachine::new(pool)
        .create(
            "default",
            &dag_row.name,
            run_id,
            None,
            None,
            params,
            &log_dir.to_string_lossy(),
            &dag_row.yaml_source,
        )
        .await
        .expect("attempt creation should succeed");

    QueueStore::new(pool)
        .enqueue(&dag_row.queue_name, &dag_row.name, run_id, priority, None)
        .await
        .expect("enqueue should succeed");

    attempt
}

async fn wait_for_terminal(pool: &sqlx::PgPool, attempt_id: uuid::Uuid, timeout: Duration) -> dagctl_db::models::Attempt {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let attempt = StateMachine::new(pool).get(attempt_id).await.expect("attempt should exist");
        if attempt.status.is_terminal() {
            return attempt;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("attempt {attempt_id} did not reach a terminal state within {timeout:?} (currently {:?})", attempt.status);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn local_scheduler(pool: sqlx::PgPool, data_dir: std::path::PathBuf) -> Scheduler {
    Scheduler::new(
        pool,
        Arc::new(NoRemoteWorkers),
        SchedulerConfig {
            tick_interval: Duration::from_millis(50),
            max_local_agents: 4,
            grace_period: Duration::from_secs(5),
            data_dir,
        },
    )
}

/// Scenario 1: a single local run ("hello" echo) goes Queued -> Running ->
/// Succeeded with no remote worker involved.
#[tokio::test]
async fn single_local_run_succeeds() {
    let (pool, db_name) = create_test_db().await;
    let data_dir = tempfile::tempdir().unwrap();

    let yaml = "\
namespace: default
name: hello
queue_name: default
steps:
  - name: say-hello
    kind: shell
    command: echo
    args: [\"hello\"]
";
    DagDef::from_yaml(yaml).expect("dag should validate");
    let dag_row = register(&pool, "hello", 0, serde_json::json!({}), yaml).await;
    let attempt = enqueue_run(&pool, &dag_row, "run-1", Priority::Low, serde_json::json!({}), data_dir.path()).await;

    let scheduler = local_scheduler(pool.clone(), data_dir.path().to_path_buf());
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { scheduler.run(run_cancel).await });

    let finished = wait_for_terminal(&pool, attempt.id, Duration::from_secs(10)).await;
    assert_eq!(finished.status, AttemptStatus::Succeeded);

    cancel.cancel();
    handle.await.unwrap().unwrap();
    pool.close().await;
    drop_test_db(&db_name).await;
}

/// Scenario 2: a run still sitting in the queue (behind another run that
/// occupies the only `maxActiveRuns` slot) can be cancelled outright.
#[tokio::test]
async fn cancel_queued_run_under_max_active_runs_one() {
    let (pool, db_name) = create_test_db().await;
    let data_dir = tempfile::tempdir().unwrap();

    let yaml = "\
namespace: default
name: solo
queue_name: default
steps:
  - name: work
    kind: shell
    command: sleep
    args: [\"5\"]
";
    let dag_row = register(&pool, "solo", 1, serde_json::json!({}), yaml).await;

    let running = enqueue_run(&pool, &dag_row, "run-running", Priority::Low, serde_json::json!({}), data_dir.path()).await;
    StateMachine::new(&pool)
        .write(running.id, AttemptStatus::Queued, AttemptStatus::Running)
        .await
        .expect("simulated admission should succeed");

    let queued = enqueue_run(&pool, &dag_row, "run-queued", Priority::Low, serde_json::json!({}), data_dir.path()).await;

    let sm = StateMachine::new(&pool);
    sm.write(queued.id, AttemptStatus::Queued, AttemptStatus::Cancelled)
        .await
        .expect("cancelling a queued run should be legal");
    QueueStore::new(&pool)
        .dequeue_by_run_id(&dag_row.name, &queued.run_id)
        .await
        .expect("cancelled run should still be removable from the queue");

    let cancelled = sm.get(queued.id).await.unwrap();
    assert_eq!(cancelled.status, AttemptStatus::Cancelled);

    let remaining = QueueStore::new(&pool).list(&dag_row.name).await.unwrap();
    assert!(remaining.iter().all(|e| e.run_id != queued.run_id));

    pool.close().await;
    drop_test_db(&db_name).await;
}

/// Scenario 3: a DAG with `workerSelector: {gpu: "true"}` is handed to a
/// worker polling with a `gpu=true` label, and withheld from one polling
/// with only `cpu=true`.
#[tokio::test]
async fn label_routed_dispatch_matches_selector() {
    use dagctl_proto::coordinator_server::Coordinator as GrpcCoordinator;
    use dagctl_proto::PollRequest;

    let (pool, db_name) = create_test_db().await;
    let data_dir = tempfile::tempdir().unwrap();

    let yaml = "\
namespace: default
name: gpu-job
queue_name: default
worker_selector:
  gpu: \"true\"
steps:
  - name: train
    kind: shell
    command: echo
    args: [\"training\"]
";
    let dag_row = register(&pool, "gpu-job", 0, serde_json::json!({"gpu": "true"}), yaml).await;
    let attempt = enqueue_run(&pool, &dag_row, "run-1", Priority::Low, serde_json::json!({}), data_dir.path()).await;

    let coordinator = CoordinatorService::with_grace_period(pool.clone(), Duration::from_millis(200), Duration::from_secs(5));
    let scheduler = Scheduler::new(
        pool.clone(),
        Arc::clone(&coordinator) as Arc<dyn RemoteDispatch>,
        SchedulerConfig {
            tick_interval: Duration::from_secs(60),
            max_local_agents: 4,
            grace_period: Duration::from_secs(5),
            data_dir: data_dir.path().to_path_buf(),
        },
    );

    let (tx, _rx) = tokio::sync::mpsc::channel(4);
    let semaphore = Arc::new(Semaphore::new(4));
    scheduler.tick(&tx, &semaphore).await.expect("tick should admit and dispatch remotely");

    let dispatched = StateMachine::new(&pool).get(attempt.id).await.unwrap();
    assert_eq!(dispatched.status, AttemptStatus::Running);

    let cpu_poll = coordinator
        .poll(tonic::Request::new(PollRequest {
            worker_id: "cpu-worker".into(),
            labels: vec!["cpu=true".into()],
            poller_id: "cpu-worker".into(),
            max_wait_ms: 50,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(cpu_poll.task.is_none(), "a cpu-only worker must not receive a gpu-selected task");

    let gpu_poll = coordinator
        .poll(tonic::Request::new(PollRequest {
            worker_id: "gpu-worker".into(),
            labels: vec!["gpu=true".into()],
            poller_id: "gpu-worker".into(),
            max_wait_ms: 50,
        }))
        .await
        .unwrap()
        .into_inner();
    let task = gpu_poll.task.expect("a gpu-labeled worker should receive the gpu-selected task");
    assert_eq!(task.run_ref.unwrap().run_id, "run-1");

    pool.close().await;
    drop_test_db(&db_name).await;
}

/// Scenario 4: a worker's control stream drops mid-run; once its grace
/// period elapses with no reconnect, the run it held is aborted. A stream
/// that never reconnects discards whatever in-flight work it was doing.
#[tokio::test]
async fn worker_lost_past_grace_period_aborts_owned_run() {
    use dagctl_proto::coordinator_client::CoordinatorClient;
    use dagctl_proto::coordinator_server::CoordinatorServer;
    use dagctl_proto::{Heartbeat, ReportRequest, RunRef, WorkerMsg};
    use tonic::transport::Server;

    let (pool, db_name) = create_test_db().await;
    let data_dir = tempfile::tempdir().unwrap();

    let yaml = "\
namespace: default
name: remote-job
queue_name: default
worker_selector:
  gpu: \"true\"
steps:
  - name: train
    kind: shell
    command: echo
    args: [\"training\"]
";
    let dag_row = register(&pool, "remote-job", 0, serde_json::json!({"gpu": "true"}), yaml).await;
    let attempt = enqueue_run(&pool, &dag_row, "run-1", Priority::Low, serde_json::json!({}), data_dir.path()).await;
    StateMachine::new(&pool)
        .write(attempt.id, AttemptStatus::Queued, AttemptStatus::Running)
        .await
        .unwrap();

    let coordinator = CoordinatorService::with_grace_period(pool.clone(), Duration::from_secs(5), Duration::from_millis(300));

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let tokio_listener = tokio::net::TcpListener::from_std(listener).unwrap();
    let incoming = tokio_stream::wrappers::TcpListenerStream::new(tokio_listener);

    let server_coordinator = Arc::clone(&coordinator);
    let server_handle = tokio::spawn(async move {
        Server::builder()
            .add_service(CoordinatorServer::from_arc(server_coordinator))
            .serve_with_incoming(incoming)
            .await
    });

    let channel = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .expect("should connect to in-process coordinator");
    let mut client = CoordinatorClient::new(channel);

    // A worker reports it owns the run, then opens a control stream and
    // heartbeats once before going silent (process crash / network
    // partition) -- no graceful close, no further heartbeats.
    client
        .report(tonic::Request::new(ReportRequest {
            run_ref: Some(RunRef { dag_name: dag_row.name.clone(), run_id: "run-1".into() }),
            worker_id: "gpu-worker".into(),
            attempt_status: None,
            node_updates: vec![],
            rejected: false,
        }))
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tx.send(WorkerMsg {
        payload: Some(dagctl_proto::coordinator::worker_msg::Payload::Heartbeat(Heartbeat {
            worker_id: "gpu-worker".into(),
        })),
    })
    .await
    .unwrap();
    let outbound = tokio_stream::wrappers::ReceiverStream::new(rx);
    let _control_response = client.control(tonic::Request::new(outbound)).await.expect("control stream should open");

    // Drop the sender: the stream closes as if the worker vanished.
    drop(tx);

    // Give the coordinator's stream-closed handler a moment to register
    // the loss, then wait past the grace period.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let aborted = StateMachine::new(&pool).get(attempt.id).await.unwrap();
    assert_eq!(aborted.status, AttemptStatus::Aborted);

    server_handle.abort();
    pool.close().await;
    drop_test_db(&db_name).await;
}

/// Scenario 5: retrying a terminal (failed) attempt creates attempt #2
/// with the same params, and it runs to completion independently.
#[tokio::test]
async fn retry_inherits_params_and_runs() {
    let (pool, db_name) = create_test_db().await;
    let data_dir = tempfile::tempdir().unwrap();

    let yaml = "\
namespace: default
name: flaky
queue_name: default
steps:
  - name: maybe-fail
    kind: shell
    command: echo
    args: [\"$GREETING\"]
";
    let dag_row = register(&pool, "flaky", 0, serde_json::json!({}), yaml).await;
    let params = serde_json::json!({"GREETING": "hi"});
    let first = enqueue_run(&pool, &dag_row, "run-1", Priority::Low, params.clone(), data_dir.path()).await;

    let sm = StateMachine::new(&pool);
    sm.write(first.id, AttemptStatus::Queued, AttemptStatus::Running).await.unwrap();
    sm.write(first.id, AttemptStatus::Running, AttemptStatus::Failed).await.unwrap();

    let previous = sm.get(first.id).await.unwrap();
    let retried = sm.retry(&previous).await.expect("retrying a terminal attempt should succeed");
    assert_eq!(retried.attempt_number, previous.attempt_number + 1);
    assert_eq!(retried.params, params);

    QueueStore::new(&pool)
        .enqueue(&dag_row.queue_name, &dag_row.name, &retried.run_id, Priority::High, None)
        .await
        .unwrap();

    let scheduler = local_scheduler(pool.clone(), data_dir.path().to_path_buf());
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { scheduler.run(run_cancel).await });

    let finished = wait_for_terminal(&pool, retried.id, Duration::from_secs(10)).await;
    assert_eq!(finished.status, AttemptStatus::Succeeded);
    assert_eq!(finished.params, params);

    cancel.cancel();
    handle.await.unwrap().unwrap();
    pool.close().await;
    drop_test_db(&db_name).await;
}

/// Scenario 6: with one High and two Low entries queued for the same DAG,
/// the queue hands out the High entry first regardless of enqueue order.
#[tokio::test]
async fn high_priority_entry_dispatches_before_low() {
    let (pool, db_name) = create_test_db().await;
    let data_dir = tempfile::tempdir().unwrap();

    let yaml = "\
namespace: default
name: priority-check
queue_name: default
max_active_runs: 0
steps:
  - name: noop
    kind: shell
    command: \"true\"
";
    let dag_row = register(&pool, "priority-check", 0, serde_json::json!({}), yaml).await;

    enqueue_run(&pool, &dag_row, "low-1", Priority::Low, serde_json::json!({}), data_dir.path()).await;
    enqueue_run(&pool, &dag_row, "low-2", Priority::Low, serde_json::json!({}), data_dir.path()).await;
    enqueue_run(&pool, &dag_row, "high-1", Priority::High, serde_json::json!({}), data_dir.path()).await;

    let ordered = QueueStore::new(&pool).list(&dag_row.name).await.unwrap();
    assert_eq!(ordered[0].run_id, "high-1");
    assert_eq!(ordered[1].run_id, "low-1");
    assert_eq!(ordered[2].run_id, "low-2");

    pool.close().await;
    drop_test_db(&db_name).await;
}

/// Scenario 7: three competing entries queued for a `maxActiveRuns: 1`
/// DAG; a single `tick()` call must admit exactly one of them, not all
/// three, even though nothing stops `admit_and_dispatch` from running its
/// inner loop body three times in one pass.
#[tokio::test]
async fn tick_admits_at_most_max_active_runs_within_a_single_tick() {
    let (pool, db_name) = create_test_db().await;
    let data_dir = tempfile::tempdir().unwrap();

    let yaml = "\
namespace: default
name: capped
queue_name: default
max_active_runs: 1
steps:
  - name: work
    kind: shell
    command: sleep
    args: [\"2\"]
";
    let dag_row = register(&pool, "capped", 1, serde_json::json!({}), yaml).await;

    let a = enqueue_run(&pool, &dag_row, "run-a", Priority::Low, serde_json::json!({}), data_dir.path()).await;
    let b = enqueue_run(&pool, &dag_row, "run-b", Priority::Low, serde_json::json!({}), data_dir.path()).await;
    let c = enqueue_run(&pool, &dag_row, "run-c", Priority::Low, serde_json::json!({}), data_dir.path()).await;

    let scheduler = local_scheduler(pool.clone(), data_dir.path().to_path_buf());
    let (tx, _rx) = tokio::sync::mpsc::channel(8);
    let semaphore = Arc::new(Semaphore::new(4));
    scheduler.tick(&tx, &semaphore).await.expect("tick should admit entries up to the cap");

    let sm = StateMachine::new(&pool);
    let statuses = [
        sm.get(a.id).await.unwrap().status,
        sm.get(b.id).await.unwrap().status,
        sm.get(c.id).await.unwrap().status,
    ];
    let running = statuses.iter().filter(|s| **s == AttemptStatus::Running).count();
    let queued = statuses.iter().filter(|s| **s == AttemptStatus::Queued).count();
    assert_eq!(running, 1, "exactly one run should be admitted within a single tick under maxActiveRuns=1");
    assert_eq!(queued, 2, "the remaining competing entries must stay queued rather than also being admitted this tick");

    pool.close().await;
    drop_test_db(&db_name).await;
}
