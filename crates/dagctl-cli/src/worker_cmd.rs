use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use dagctl_core::worker::{self, WorkerConfig};

use crate::config::DagctlConfig;
use crate::enqueue_cmd::data_dir;

/// `dagctl worker`: dial the coordinator and poll for tasks until
/// interrupted.
pub async fn run(
    config: &DagctlConfig,
    worker_id: Option<String>,
    labels: Vec<String>,
    max_concurrent: Option<usize>,
) -> Result<()> {
    let worker_id = worker_id.unwrap_or_else(|| {
        format!("worker-{}", uuid::Uuid::new_v4().simple())
    });

    let worker_config = WorkerConfig {
        coordinator_addr: config.coordinator_addr.clone(),
        worker_id: worker_id.clone(),
        labels,
        max_concurrent: max_concurrent.unwrap_or(4),
        log_root: data_dir().join("worker-logs"),
        ..WorkerConfig::default()
    };

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

    tracing::info!(worker_id = %worker_id, coordinator_addr = %config.coordinator_addr, "worker starting");

    worker::run(worker_config, cancel).await.context("worker loop failed")
}
