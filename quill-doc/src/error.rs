use thiserror::Error;

/// Failure while applying a step to a document tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("Position {pos} out of range (content size {size})")]
    OutOfRange { pos: usize, size: usize },

    #[error("Replace error: {0}")]
    Replace(String),

    #[error("Step failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum DocError {
    #[error("Invalid document JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Step(#[from] StepError),
}
