use anyhow::{bail, Context, Result};

use dagctl_proto::coordinator_client::CoordinatorClient;
use dagctl_proto::{CancelRequest, RunRef};

/// `dagctl stop`: send `Cancel(ref)` to the coordinator. Exit 0 if
/// accepted, non-zero if the coordinator has no owner on record for the ref.
pub async fn run(coordinator_addr: &str, dag_name: &str, run_id: &str) -> Result<()> {
    let mut client = CoordinatorClient::connect(coordinator_addr.to_string())
        .await
        .with_context(|| format!("failed to dial coordinator at {coordinator_addr}"))?;

    let response = client
        .cancel(tonic::Request::new(CancelRequest {
            run_ref: Some(RunRef {
                dag_name: dag_name.to_string(),
                run_id: run_id.to_string(),
            }),
        }))
        .await
        .context("cancel RPC failed")?;

    if response.into_inner().accepted {
        println!("Cancel sent for {dag_name}/{run_id}");
        Ok(())
    } else {
        bail!("coordinator has no known owner for {dag_name}/{run_id}");
    }
}
