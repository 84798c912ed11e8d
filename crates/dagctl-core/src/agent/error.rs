use thiserror::Error;

use crate::attempt::AttemptError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("step '{0}' has no executable command configured")]
    NotExecutable(String),

    #[error("failed to spawn step '{step}': {source}")]
    Spawn {
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("run was cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Attempt(#[from] AttemptError),

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}
