//! Test helpers and harness for plugin testing

use crate::context::PluginContext;
use crate::module::PluginModule;
use crate::plugin::Plugin;
use crate::services::ServiceRegistry;
use crate::testing::mocks::MockPlugin;
use crate::PluginError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lifecycle state tracked by [`PluginTestHarness`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessState {
    /// Constructed, not yet initialized
    Created,
    /// `initialize` succeeded
    Initialized,
    /// `shutdown` succeeded
    Shutdown,
    /// Last lifecycle call failed
    Failed(String),
}

/// Drives a plugin through its lifecycle outside the host
#[derive(Debug)]
pub struct PluginTestHarness<P: Plugin> {
    plugin: P,
    services: Arc<ServiceRegistry>,
    state: HarnessState,
}

impl<P: Plugin> PluginTestHarness<P> {
    /// Create a new test harness with a plugin
    pub fn new(plugin: P) -> Self {
        Self {
            plugin,
            services: Arc::new(ServiceRegistry::new()),
            state: HarnessState::Created,
        }
    }

    /// Get a reference to the plugin
    pub fn plugin(&self) -> &P {
        &self.plugin
    }

    /// Get a mutable reference to the plugin
    pub fn plugin_mut(&mut self) -> &mut P {
        &mut self.plugin
    }

    /// Services visible to the plugin
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Get the current state
    pub fn state(&self) -> &HarnessState {
        &self.state
    }

    /// Initialize the plugin
    pub async fn initialize(&mut self) -> Result<(), PluginError> {
        let ctx = PluginContext::new(
            self.plugin.id().to_string(),
            Arc::clone(&self.services),
            CancellationToken::new(),
        );
        let result = self.plugin.initialize(ctx).await;
        self.track(result, HarnessState::Initialized)
    }

    /// Register the plugin's services, if it contributes any
    pub fn configure_services(&self) -> Result<bool, PluginError> {
        match self.plugin.as_service_contribution() {
            Some(contribution) => contribution.configure_services(&self.services).map(|()| true),
            None => Ok(false),
        }
    }

    /// Shut the plugin down
    pub async fn shutdown(&mut self) -> Result<(), PluginError> {
        let result = self.plugin.shutdown(CancellationToken::new()).await;
        self.track(result, HarnessState::Shutdown)
    }

    /// Run initialize and shutdown back to back
    pub async fn run_lifecycle(&mut self, hold: Duration) -> Result<(), PluginError> {
        self.initialize().await?;
        tokio::time::sleep(hold).await;
        self.shutdown().await
    }

    fn track(
        &mut self,
        result: Result<(), PluginError>,
        next: HarnessState,
    ) -> Result<(), PluginError> {
        match result {
            Ok(()) => {
                self.state = next;
                Ok(())
            }
            Err(e) => {
                self.state = HarnessState::Failed(e.to_string());
                Err(e)
            }
        }
    }
}

/// Module exporting a single mock type whose instances clone `plugin`
pub fn mock_module(plugin: MockPlugin) -> PluginModule {
    let mut module = PluginModule::new();
    let type_name = format!("mock::{}", plugin.id());
    module.register_fn(type_name, move || Box::new(plugin.clone()));
    module
}
