use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("dag definition failed validation: {0}")]
    ValidationFailed(String),

    #[error("step '{0}' depends on unknown step '{1}'")]
    UnknownDependency(String, String),

    #[error("dag contains a dependency cycle involving step '{0}'")]
    Cycle(String),

    #[error("failed to parse dag yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
}
