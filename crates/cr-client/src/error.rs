use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("roomId is required")]
    MissingRoom,

    #[error("Message {0} already has a request in flight")]
    DuplicateInFlight(Uuid),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("Correlation engine is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Errors that a later attempt may succeed past.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Connect(_) | ClientError::Transport(_) | ClientError::Timeout(_)
        )
    }
}
