use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Frame content is not accessible: {0}")]
    FrameInaccessible(String),

    #[error("Invalid tree operation: {0}")]
    InvalidTreeOperation(String),

    #[error("Context disconnected: {0}")]
    ContextDisconnected(String),

    #[error("{0}")]
    ActionFailed(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SnapError {
    fn from(err: serde_json::Error) -> Self {
        SnapError::Serialization(err.to_string())
    }
}
