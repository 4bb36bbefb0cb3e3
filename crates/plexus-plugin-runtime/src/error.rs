//! Plugin runtime error types

use plexus_plugin_api::PluginError;
use plexus_store::StoreError;
use std::fmt;
use std::path::PathBuf;

/// Failure to activate a plugin
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The module file does not exist
    #[error("Module not found: {}", .0.display())]
    ModuleNotFound(PathBuf),

    /// The module exports no usable plugin type
    #[error("No plugin type in {}: {reason}", path.display())]
    NoPluginType {
        /// Module path
        path: PathBuf,
        /// Why no type was selected
        reason: String,
    },

    /// The file could not be opened as a plugin module
    #[error("Invalid module {}: {reason}", path.display())]
    InvalidModule {
        /// Module path
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// Construction or `initialize` failed, panicked or timed out
    #[error("Initialization of plugin {id} failed: {reason}")]
    InitializationFailed {
        /// Record id
        id: String,
        /// Underlying failure
        reason: String,
    },

    /// The caller cancelled the load
    #[error("Loading plugin {0} was cancelled")]
    Cancelled(String),
}

impl LoadError {
    /// Create a new initialization failure
    pub fn init_failed(id: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InitializationFailed {
            id: id.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure to register a module found on disk
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The path does not exist
    #[error("Module not found: {}", .0.display())]
    ModuleNotFound(PathBuf),

    /// The path exists but holds no usable plugin type
    #[error("Not a plugin module {}: {reason}", path.display())]
    NotAPlugin {
        /// Module path
        path: PathBuf,
        /// Why inspection failed
        reason: String,
    },
}

impl DiscoveryError {
    /// Create a new not-a-plugin error
    pub fn not_a_plugin(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::NotAPlugin {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Plugin runtime error type
#[derive(Debug, thiserror::Error)]
pub enum PluginRuntimeError {
    /// Loading a plugin failed
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Registering a module failed
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Plugin error
    #[error("Plugin error: {0}")]
    PluginError(#[from] PluginError),

    /// Plugin not found
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Metadata repository failure
    #[error("Metadata store error: {0}")]
    Store(#[from] StoreError),

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result type for plugin runtime operations
pub type Result<T> = std::result::Result<T, PluginRuntimeError>;

impl PluginRuntimeError {
    /// Create a new plugin not found error
    pub fn not_found(id: impl fmt::Display) -> Self {
        Self::PluginNotFound(id.to_string())
    }

    /// Create a new invalid state error
    pub fn invalid_state(msg: impl fmt::Display) -> Self {
        Self::InvalidState(msg.to_string())
    }

    /// Create a new other error
    pub fn other(msg: impl fmt::Display) -> Self {
        Self::Other(msg.to_string())
    }

    /// Whether this error came from a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PluginRuntimeError::Cancelled | PluginRuntimeError::Load(LoadError::Cancelled(_))
        )
    }
}
