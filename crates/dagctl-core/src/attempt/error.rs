use dagctl_db::models::AttemptStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by [`super::StateMachine`].
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("attempt already exists for this run ref")]
    AlreadyExists,

    #[error("no attempt found for run ref")]
    NotFound,

    #[error("cannot transition attempt {id} from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: AttemptStatus,
        to: AttemptStatus,
    },

    #[error("attempt {id} is held by a concurrent writer, retry the transition")]
    Busy { id: Uuid },

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}
