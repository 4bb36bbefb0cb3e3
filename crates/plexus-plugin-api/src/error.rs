//! Plugin error types

use std::fmt;

/// Error type returned by plugin code
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Initialization failed
    #[error("Initialization failed: {0}")]
    InitError(String),

    /// Shutdown failed
    #[error("Shutdown failed: {0}")]
    ShutdownError(String),

    /// Background task failed to start or stop
    #[error("Background task error: {0}")]
    TaskError(String),

    /// Service registration failed
    #[error("Service error: {0}")]
    ServiceError(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Plugin code panicked and the panic was caught at the boundary
    #[error("Plugin code panicked: {0}")]
    Panicked(String),

    /// The operation observed a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for plugin operations
pub type Result<T> = std::result::Result<T, PluginError>;

impl PluginError {
    /// Create a new initialization error
    pub fn init(msg: impl fmt::Display) -> Self {
        Self::InitError(msg.to_string())
    }

    /// Create a new shutdown error
    pub fn shutdown(msg: impl fmt::Display) -> Self {
        Self::ShutdownError(msg.to_string())
    }

    /// Create a new background task error
    pub fn task(msg: impl fmt::Display) -> Self {
        Self::TaskError(msg.to_string())
    }

    /// Create a new service error
    pub fn service(msg: impl fmt::Display) -> Self {
        Self::ServiceError(msg.to_string())
    }

    /// Create a new invalid state error
    pub fn invalid_state(msg: impl fmt::Display) -> Self {
        Self::InvalidState(msg.to_string())
    }

    /// Create a new runtime error
    pub fn runtime(msg: impl fmt::Display) -> Self {
        Self::RuntimeError(msg.to_string())
    }

    /// Create a new panic error
    pub fn panicked(msg: impl fmt::Display) -> Self {
        Self::Panicked(msg.to_string())
    }

    /// Whether this error came from a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PluginError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PluginError::init("test");
        assert!(matches!(err, PluginError::InitError(_)));

        let err = PluginError::task("test");
        assert!(matches!(err, PluginError::TaskError(_)));

        assert!(PluginError::Cancelled.is_cancelled());
        assert!(!PluginError::runtime("boom").is_cancelled());
    }

    #[test]
    fn test_error_display() {
        let err = PluginError::InitError("database unreachable".to_string());
        assert_eq!(err.to_string(), "Initialization failed: database unreachable");
    }
}
