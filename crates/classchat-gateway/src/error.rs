use thiserror::Error;
use uuid::Uuid;

use classchat_types::events::{AckError, AckErrorCode};

/// Message shown to the sender for any failure that is not their fault.
pub const GENERIC_FAILURE: &str = "something went wrong";

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("sender is not a participant of conversation {0}")]
    Unauthorized(Uuid),

    #[error("conversation {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl MessagingError {
    /// What the sender gets in its ack. Store and runtime failures collapse
    /// into one generic error; the cause only goes to the log.
    pub fn to_ack_error(&self) -> AckError {
        let (code, message) = match self {
            Self::Validation(reason) => (AckErrorCode::Validation, reason.clone()),
            Self::Unauthorized(_) => (
                AckErrorCode::Unauthorized,
                "you are not a member of this conversation".to_string(),
            ),
            Self::NotFound(_) => (AckErrorCode::NotFound, "conversation not found".to_string()),
            Self::Store(_) | Self::Join(_) => (AckErrorCode::Internal, GENERIC_FAILURE.to_string()),
        };
        AckError { code, message }
    }
}
