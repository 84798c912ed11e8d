use thiserror::Error;

use crate::agent::AgentError;
use crate::dag::DagError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to connect to coordinator at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error(transparent)]
    Rpc(#[from] tonic::Status),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}
