use tabsnap::SnapError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Context disconnected: {0}")]
    ContextDisconnected(String),

    #[error("Timeout waiting for cmdres (iid={0})")]
    Timeout(String),

    #[error("Context reported an error: {0}")]
    Remote(String),

    #[error(transparent)]
    Protocol(#[from] SnapError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RelayError> for SnapError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::ContextDisconnected(cid) => SnapError::ContextDisconnected(cid),
            RelayError::Timeout(iid) => {
                SnapError::Timeout(format!("Timeout waiting for cmdres (iid={iid})"))
            }
            RelayError::Remote(message) => SnapError::ActionFailed(message),
            RelayError::Protocol(inner) => inner,
            other => SnapError::Transport(other.to_string()),
        }
    }
}
