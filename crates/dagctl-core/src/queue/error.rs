use thiserror::Error;

/// Errors surfaced by [`super::QueueStore`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no queue entry found for this run ref")]
    NotFound,

    #[error("queue '{queue_name}' is at capacity ({depth}/{capacity})")]
    CapacityExceeded {
        queue_name: String,
        depth: i64,
        capacity: i64,
    },

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}
