use thiserror::Error;
use tonic::{Code, Status};

use crate::attempt::AttemptError;
use crate::dag::DagError;
use crate::queue::QueueError;

/// Errors surfaced by the Coordinator RPC handlers, a superset of the
/// store-level errors plus the two kinds that only make sense at the
/// service boundary (a lost worker, a cancelled long-poll).
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Attempt(#[from] AttemptError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error("worker '{0}' lost its control stream past the liveness grace period")]
    WorkerLost(String),

    #[error("request was cancelled")]
    Cancelled,

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// Maps the §7 error taxonomy onto `tonic::Status` the way
/// `pantsbuild-pants`'s remote-execution client reads a response `Code`
/// back into a typed error, just inverted: here we produce the `Code`
/// from our own typed error rather than consume one.
impl From<CoordinatorError> for Status {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Attempt(AttemptError::NotFound) => Status::not_found(err.to_string()),
            CoordinatorError::Attempt(AttemptError::AlreadyExists) => {
                Status::already_exists(err.to_string())
            }
            CoordinatorError::Attempt(AttemptError::InvalidTransition { .. }) => {
                Status::failed_precondition(err.to_string())
            }
            CoordinatorError::Attempt(AttemptError::Busy { .. }) => Status::unavailable(err.to_string()),
            CoordinatorError::Attempt(AttemptError::Db(_)) => Status::internal(err.to_string()),
            CoordinatorError::Queue(QueueError::NotFound) => Status::not_found(err.to_string()),
            CoordinatorError::Queue(QueueError::CapacityExceeded { .. }) => {
                Status::resource_exhausted(err.to_string())
            }
            CoordinatorError::Queue(QueueError::Db(_)) => Status::internal(err.to_string()),
            CoordinatorError::Dag(DagError::ValidationFailed(_) | DagError::Parse(_)) => {
                Status::invalid_argument(err.to_string())
            }
            CoordinatorError::Dag(DagError::UnknownDependency(..) | DagError::Cycle(_)) => {
                Status::invalid_argument(err.to_string())
            }
            CoordinatorError::WorkerLost(_) => Status::new(Code::Aborted, err.to_string()),
            CoordinatorError::Cancelled => Status::cancelled(err.to_string()),
            CoordinatorError::Db(_) => Status::internal(err.to_string()),
        }
    }
}
