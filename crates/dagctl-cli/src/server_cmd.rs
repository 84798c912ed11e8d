use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};

use dagctl_core::coordinator::CoordinatorService;
use dagctl_core::scheduler::{Scheduler, SchedulerConfig};
use dagctl_proto::coordinator_server::CoordinatorServer;

use crate::config::DagctlConfig;
use crate::enqueue_cmd::data_dir;

/// `dagctl server`: bundle the Coordinator gRPC service and the Scheduler
/// loop into a single process, for single-node deployments that don't
/// need the two to scale independently. The scheduler dispatches to the
/// same `CoordinatorService` instance it shares the process with, so DAGs
/// with a non-empty `worker_selector` are still routed to remote workers.
pub async fn run(pool: PgPool, config: &DagctlConfig) -> Result<()> {
    let addr = config.listen_addr.parse().context("invalid coordinator listen address")?;
    let service = CoordinatorService::new(pool.clone(), Duration::from_secs(20));

    let mut server = Server::builder();

    match (&config.tls_cert, &config.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = std::fs::read_to_string(cert_path).context("failed to read TLS cert")?;
            let key = std::fs::read_to_string(key_path).context("failed to read TLS key")?;
            let mut tls = ServerTlsConfig::new()
                .identity(Identity::from_pem(cert, key))
                .min_tls_version(tonic::transport::server::TlsVersion::TLS1_2);

            if let Some(ca_path) = &config.client_ca {
                let ca = std::fs::read_to_string(ca_path).context("failed to read client CA bundle")?;
                tls = tls.client_ca_root(Certificate::from_pem(ca)).client_auth_optional(false);
            }

            server = server.tls_config(tls).context("failed to configure TLS")?;
        }
        (None, None) => {
            if std::env::var("DAGCTL_INSECURE").as_deref() != Ok("1") {
                bail!("no TLS cert/key configured; set DAGCTL_INSECURE=1 to serve plaintext h2c");
            }
        }
        _ => bail!("coordinator TLS requires both tls_cert and tls_key"),
    }

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

    let scheduler = Scheduler::new(
        pool,
        Arc::clone(&service) as Arc<dyn dagctl_core::scheduler::RemoteDispatch>,
        SchedulerConfig {
            tick_interval: Duration::from_secs(5),
            max_local_agents: 4,
            grace_period: Duration::from_secs(10),
            data_dir: data_dir(),
        },
    );

    let scheduler_cancel = cancel.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_cancel).await });

    tracing::info!(addr = %config.listen_addr, "server (coordinator + scheduler) listening");

    server
        .add_service(CoordinatorServer::from_arc(service))
        .serve_with_shutdown(addr, cancel.cancelled())
        .await
        .context("coordinator server error")?;

    scheduler_task.await.context("scheduler task panicked")?.context("scheduler loop failed")?;

    Ok(())
}
