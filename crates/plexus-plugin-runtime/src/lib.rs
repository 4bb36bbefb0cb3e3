//! # Plexus Plugin Runtime
//!
//! Discovery, isolated loading and supervision of Plexus plugins.
//!
//! ## Features
//!
//! - **Discovery**: scan a directory, inspect modules, record their metadata
//! - **Registry**: enable/disable state backed by a metadata repository
//! - **Loader**: at-most-once activation with deferred module release
//! - **Event Bus**: typed publish/subscribe with per-handler isolation
//! - **Supervisor**: start and stop plugin background tasks in order
//! - **Directory Watcher**: register modules as they are dropped in
//!
//! ## Example
//!
//! ```rust,no_run
//! use plexus_plugin_runtime::prelude::*;
//! use plexus_store::InMemoryRepository;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<()> {
//! let options = PluginOptions::with_directory("plugins");
//! let resolver = Arc::new(DynamicLibraryResolver::new());
//! let repository = Arc::new(InMemoryRepository::new());
//!
//! let discovery = PluginDiscovery::new(options.clone(), resolver.clone(), repository.clone());
//! let registry = PluginRegistry::new(repository);
//! let loader = PluginLoader::new(resolver, Arc::new(ServiceRegistry::new()), &options);
//!
//! let cancel = CancellationToken::new();
//! discovery.discover(&cancel).await?;
//! for record in registry.list_enabled().await? {
//!     loader.load(&record, &cancel).await?;
//! }
//! loader.shutdown_all(&cancel).await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod discovery;
pub mod error;
pub mod event_bus;
pub mod hot_reload;
pub mod loader;
pub mod module;
pub mod options;
pub mod registry;
pub mod supervisor;

pub use discovery::PluginDiscovery;
pub use error::{DiscoveryError, LoadError, PluginRuntimeError, Result};
pub use event_bus::{EventBus, HandlerError, PublishCancelled, PublishReport, Subscription};
pub use hot_reload::DirectoryWatcher;
pub use loader::{InstallOutcome, PluginHandle, PluginLoader};
pub use module::{
    DynamicLibraryResolver, ModuleBoundary, ModuleError, ModuleLease, ModuleResolver,
    SelectionError, StaticModuleCatalog,
};
pub use options::PluginOptions;
pub use registry::PluginRegistry;
pub use supervisor::{BackgroundTaskSupervisor, StartedTask};

// Re-export plugin API types for convenience
pub use plexus_plugin_api::{
    Capabilities, Plugin, PluginContext, PluginDescriptor, PluginError, ServiceRegistry,
};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::discovery::PluginDiscovery;
    pub use crate::error::{PluginRuntimeError, Result};
    pub use crate::event_bus::{EventBus, Subscription};
    pub use crate::loader::{InstallOutcome, PluginHandle, PluginLoader};
    pub use crate::module::{DynamicLibraryResolver, ModuleResolver, StaticModuleCatalog};
    pub use crate::options::PluginOptions;
    pub use crate::registry::PluginRegistry;
    pub use crate::supervisor::BackgroundTaskSupervisor;
    pub use plexus_plugin_api::prelude::*;
}
