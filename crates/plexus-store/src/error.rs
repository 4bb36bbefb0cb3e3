//! Error types for metadata storage

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error types for repository operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding records failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl StoreError {
    /// Create a new backend error
    pub fn backend(msg: impl std::fmt::Display) -> Self {
        Self::Backend(msg.to_string())
    }
}
