use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};

use dagctl_core::coordinator::CoordinatorService;
use dagctl_proto::coordinator_server::CoordinatorServer;

use crate::config::DagctlConfig;

/// `dagctl coordinator`: run the gRPC Coordinator service standalone.
///
/// TLS per §6: a cert+key pair enables server TLS; a client-CA bundle on
/// top of that requires mTLS (`RequireAndVerifyClientCert`, min TLS 1.2).
/// With neither configured, `DAGCTL_INSECURE=1` is required to serve
/// plaintext h2c.
pub async fn run(pool: PgPool, config: &DagctlConfig) -> Result<()> {
    let addr = config.listen_addr.parse().context("invalid coordinator listen address")?;
    let service = CoordinatorService::new(pool, Duration::from_secs(20));

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

    tracing::info!(addr = %config.listen_addr, "coordinator listening");

    server
        .add_service(CoordinatorServer::from_arc(service))
        .serve_with_shutdown(addr, cancel.cancelled())
        .await
        .context("coordinator server error")?;

    Ok(())
}
