use thiserror::Error;

use quill_doc::StepError;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to apply steps: {0}")]
    Step(#[from] StepError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    PermissionDenied(String),

    /// A request that is well formed but not allowed, e.g. nesting a page
    /// under its own child.
    #[error("{0}")]
    Undesirable(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Message suitable for an `error` frame.
    pub fn client_message(&self) -> String {
        match self {
            SyncError::Store(StoreError::NotFound(id)) => format!("Page not found: {id}"),
            SyncError::Store(_) | SyncError::Io(_) | SyncError::Transport(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
