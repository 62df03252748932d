//! Error types for the assistant core.

/// Top-level error type for the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Configuration load/parse error.
    #[error("config error: {0}")]
    Config(String),

    /// History/reminder storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Local or cloud model error.
    #[error("model error: {0}")]
    Model(String),

    /// Voice capture/transcription/synthesis error.
    #[error("voice error: {0}")]
    Voice(String),

    /// A referenced plan or run id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for AssistantError {
    fn from(e: rusqlite::Error) -> Self {
        AssistantError::Storage(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
