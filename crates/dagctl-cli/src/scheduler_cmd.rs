use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use dagctl_core::scheduler::{NoRemoteWorkers, Scheduler, SchedulerConfig};

use crate::enqueue_cmd::data_dir;

/// `dagctl scheduler`: run the queue-drain loop standalone, with no
/// coordinator — every DAG it admits must run with an empty
/// `worker_selector`, since there is nowhere to dispatch remote Tasks.
pub async fn run(pool: PgPool) -> Result<()> {
    let scheduler = Scheduler::new(
        pool,
        Arc::new(NoRemoteWorkers),
        SchedulerConfig {
            tick_interval: Duration::from_secs(5),
            max_local_agents: 4,
            grace_period: Duration::from_secs(10),
            data_dir: data_dir(),
        },
    );

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    tracing::info!("scheduler starting");
    scheduler.run(cancel).await.context("scheduler loop failed")
}
