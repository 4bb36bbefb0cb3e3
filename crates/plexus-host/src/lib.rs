//! # Plexus Host
//!
//! Host composition and lifecycle management with:
//! - Startup in dependency order (discover, load, contribute, start tasks)
//! - Shutdown in reverse order
//! - Enable/disable with activation and deactivation
//! - Graceful shutdown with signal handling
//! - Optional plugin directory watching

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod host;
pub mod shutdown;

pub use error::{HostError, Result};
pub use host::{HostBuilder, PluginHost, StartReport};
pub use shutdown::{ShutdownSignal, SignalHandler};

use std::fmt;

/// Host lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Built, never started
    Created,
    /// Startup in progress
    Starting,
    /// Plugins active
    Running,
    /// Shutdown in progress
    Stopping,
    /// Stopped; may be started again
    Stopped,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{HostError, Result};
    pub use crate::host::{HostBuilder, PluginHost, StartReport};
    pub use crate::shutdown::{ShutdownSignal, SignalHandler};
    pub use crate::HostState;
}
