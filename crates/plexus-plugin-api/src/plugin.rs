//! Core plugin trait and capability types

use crate::background::BackgroundWork;
use crate::context::PluginContext;
use crate::error::Result;
use crate::installer::PluginInstaller;
use crate::services::ServiceRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Lifecycle contract every plugin implements
///
/// Optional behavior is advertised through the `as_*` accessors. The host
/// evaluates them once when the plugin is loaded and caches the answer, so
/// they must return the same result for the lifetime of the instance.
#[async_trait]
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Stable unique identifier
    fn id(&self) -> &str;

    /// Human readable name
    fn name(&self) -> &str;

    /// Free-form version string
    fn version(&self) -> &str;

    /// Initialize the plugin
    ///
    /// Called once per load, before the plugin becomes visible to anyone
    /// else. Host services are reachable through `ctx.services()`.
    async fn initialize(&mut self, ctx: PluginContext) -> Result<()>;

    /// Release everything acquired in [`Plugin::initialize`]
    async fn shutdown(&mut self, cancel: CancellationToken) -> Result<()>;

    /// Service contribution capability
    fn as_service_contribution(&self) -> Option<&dyn ServiceContribution> {
        None
    }

    /// Background work capability
    fn as_background_work(&self) -> Option<&dyn BackgroundWork> {
        None
    }

    /// First-time installation capability
    fn as_installer(&self) -> Option<&dyn PluginInstaller> {
        None
    }

    /// Identity triple of this instance
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: self.id().to_string(),
            name: self.name().to_string(),
            version: self.version().to_string(),
        }
    }

    /// Capabilities this instance advertises
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            service_contribution: self.as_service_contribution().is_some(),
            background_work: self.as_background_work().is_some(),
            installer: self.as_installer().is_some(),
        }
    }
}

/// Capability for plugins that register services or request middleware
///
/// The host calls [`configure_services`](Self::configure_services) for every
/// active plugin. [`configure_pipeline`](Self::configure_pipeline) is called
/// by whatever request layer embeds the host, with its own pipeline type.
/// The plugin core never inspects what gets registered.
pub trait ServiceContribution: Send + Sync {
    /// Register services into the shared registry
    fn configure_services(&self, services: &ServiceRegistry) -> Result<()>;

    /// Wire handlers or middleware into the embedding request pipeline
    ///
    /// `pipeline` is opaque to the host. Downcast it to the pipeline type the
    /// plugin targets and ignore anything else.
    fn configure_pipeline(&self, pipeline: &mut dyn Any) -> Result<()> {
        let _ = pipeline;
        Ok(())
    }
}

/// Identity metadata read from a plugin instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Plugin id
    pub id: String,

    /// Plugin name
    pub name: String,

    /// Plugin version
    pub version: String,
}

/// Optional capabilities, evaluated once at load time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Implements [`ServiceContribution`]
    pub service_contribution: bool,

    /// Implements [`BackgroundWork`]
    pub background_work: bool,

    /// Implements [`PluginInstaller`]
    #[serde(default)]
    pub installer: bool,
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("lifecycle")?;
        if self.service_contribution {
            f.write_str("+services")?;
        }
        if self.background_work {
            f.write_str("+background")?;
        }
        if self.installer {
            f.write_str("+installer")?;
        }
        Ok(())
    }
}
