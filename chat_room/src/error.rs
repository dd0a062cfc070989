use thiserror::Error;

/// Errors produced by the chat room core.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message must have content or at least one image")]
    EmptyMessage,
    #[error("message exceeds {max} characters")]
    ContentTooLong { max: usize },
    #[error("room name exceeds {max} characters")]
    RoomNameTooLong { max: usize },
    #[error("invalid image reference: {0}")]
    InvalidImage(String),
    #[error("image is already attached to another message: {0}")]
    ImageInUse(String),
    #[error("images are disabled")]
    ImagesDisabled,
    #[error("image exceeds {max} bytes")]
    ImageTooLarge { max: i64 },
    #[error("unsupported image type")]
    UnsupportedImage,
    #[error("chat room is disabled")]
    RoomDisabled,
    #[error("image budget must be positive, got {0}")]
    InvalidBudget(i64),
    #[error("hub is no longer running")]
    HubClosed,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ChatError {
    /// Whether the error is a user-facing rejection rather than a server fault.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ChatError::EmptyMessage
                | ChatError::ContentTooLong { .. }
                | ChatError::RoomNameTooLong { .. }
                | ChatError::InvalidImage(_)
                | ChatError::ImageInUse(_)
                | ChatError::ImagesDisabled
                | ChatError::ImageTooLarge { .. }
                | ChatError::UnsupportedImage
                | ChatError::InvalidBudget(_)
        )
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
