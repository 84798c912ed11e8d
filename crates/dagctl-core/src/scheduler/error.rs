use thiserror::Error;

use crate::attempt::AttemptError;
use crate::dag::DagError;
use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Attempt(#[from] AttemptError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error("no dag definition registered for '{0}'")]
    UnknownDag(String),

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}
