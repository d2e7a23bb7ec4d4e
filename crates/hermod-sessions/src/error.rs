use thiserror::Error;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested session does not exist in the table.
    #[error("session not found: {key}")]
    NotFound { key: String },

    /// Reading or writing the store document failed.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store document could not be serialised.
    #[error("store serialisation error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
