//! Host errors

use plexus_config::ConfigError;
use plexus_plugin_runtime::{LoadError, PluginError, PluginRuntimeError};
use plexus_store::StoreError;
use thiserror::Error;

/// Result type for host operations
pub type Result<T> = std::result::Result<T, HostError>;

/// Errors raised by the plugin host
#[derive(Error, Debug)]
pub enum HostError {
    /// Configuration could not be loaded or is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A runtime component failed
    #[error(transparent)]
    Runtime(#[from] PluginRuntimeError),

    /// The metadata store could not be opened
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A plugin's installer failed; the plugin was unloaded again
    #[error("Plugin {id} failed to install: {source}")]
    Install {
        /// Record id of the plugin
        id: String,
        /// What the installer reported
        #[source]
        source: PluginError,
    },

    /// Operation not valid in the host's current state
    #[error("Invalid host state: {0}")]
    InvalidState(String),

    /// OS signal handling failed
    #[error("Signal handling error: {0}")]
    Signal(#[from] std::io::Error),
}

impl From<LoadError> for HostError {
    fn from(err: LoadError) -> Self {
        Self::Runtime(err.into())
    }
}

impl HostError {
    /// Whether the operation was stopped by cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Runtime(e) => e.is_cancelled(),
            Self::Install { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
