//! # Plexus Plugin API
//!
//! This crate provides the SDK for writing plugins hosted by Plexus.
//!
//! ## Capabilities
//!
//! - **Lifecycle** (mandatory): identity plus `initialize` / `shutdown`
//! - **Service contribution**: register services into the host registry
//! - **Background work**: long-running tasks supervised by the host
//! - **Installer**: one-time setup run after the first load
//!
//! Plugins exported with [`declare_plexus_plugin!`] run inside the host's
//! tokio runtime and tracing dispatcher, and panics in their code are caught
//! before they reach the host. See [`boundary`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use plexus_plugin_api::prelude::*;
//!
//! #[derive(Debug, Default)]
//! struct MyPlugin;
//!
//! #[async_trait]
//! impl Plugin for MyPlugin {
//!     fn id(&self) -> &str { "my-plugin" }
//!     fn name(&self) -> &str { "My Plugin" }
//!     fn version(&self) -> &str { "1.0.0" }
//!
//!     async fn initialize(&mut self, ctx: PluginContext) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//!
//!     async fn shutdown(&mut self, cancel: CancellationToken) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//! }
//!
//! plexus_plugin_api::declare_plexus_plugin!(MyPlugin);
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod background;
pub mod boundary;
pub mod context;
pub mod error;
pub mod installer;
pub mod module;
pub mod plugin;
pub mod services;

#[cfg(feature = "testing")]
pub mod testing;

// Re-export commonly used types
pub use background::{BackgroundService, BackgroundTask, BackgroundWork, ServiceTask};
pub use boundary::{HostEnv, Isolated};
pub use context::PluginContext;
pub use error::{PluginError, Result};
pub use installer::PluginInstaller;
pub use module::{
    PluginEntryFn, PluginFactory, PluginModule, API_VERSION_SYMBOL, ENTRY_SYMBOL,
    PLUGIN_API_VERSION,
};
pub use plugin::{Capabilities, Plugin, PluginDescriptor, ServiceContribution};
pub use services::ServiceRegistry;
pub use tokio_util::sync::CancellationToken;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::background::{BackgroundService, BackgroundTask, BackgroundWork, ServiceTask};
    pub use crate::context::PluginContext;
    pub use crate::error::PluginError;
    pub use crate::installer::PluginInstaller;
    pub use crate::module::{PluginFactory, PluginModule};
    pub use crate::plugin::{Plugin, PluginDescriptor, ServiceContribution};
    pub use crate::services::ServiceRegistry;
    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}
