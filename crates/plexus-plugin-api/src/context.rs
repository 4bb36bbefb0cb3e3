//! Plugin context types

use crate::boundary::HostEnv;
use crate::services::ServiceRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context handed to [`Plugin::initialize`](crate::Plugin::initialize)
#[derive(Debug, Clone)]
pub struct PluginContext {
    plugin_id: String,
    services: Arc<ServiceRegistry>,
    cancel: CancellationToken,
    host: Option<HostEnv>,
}

impl PluginContext {
    /// Create a new plugin context
    ///
    /// The host environment is captured from the calling thread.
    pub fn new(
        plugin_id: impl Into<String>,
        services: Arc<ServiceRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            services,
            cancel,
            host: HostEnv::current(),
        }
    }

    /// Replace the captured host environment
    pub fn with_host_env(mut self, host: Option<HostEnv>) -> Self {
        self.host = host;
        self
    }

    /// Runtime and dispatcher of the host
    ///
    /// `None` when the context was created outside a tokio runtime.
    pub fn host_env(&self) -> Option<&HostEnv> {
        self.host.as_ref()
    }

    /// Id of the record being loaded
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Host service registry
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Resolve one host service by type
    pub fn service<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services.get::<T>()
    }

    /// Cancellation signal for the initialization
    ///
    /// Fires when the caller gives up on the load or the deadline expires.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether initialization was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_context() {
        let services = Arc::new(ServiceRegistry::new());
        services.insert(Arc::new(42u32));

        let cancel = CancellationToken::new();
        let ctx = PluginContext::new("p1", services, cancel.clone());

        assert_eq!(ctx.plugin_id(), "p1");
        assert_eq!(*ctx.service::<u32>().unwrap(), 42);
        assert!(ctx.service::<String>().is_none());

        assert!(!ctx.is_cancelled());
        cancel.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.host_env().is_none());
    }

    #[tokio::test]
    async fn test_context_captures_host_env() {
        let ctx = PluginContext::new(
            "p1",
            Arc::new(ServiceRegistry::new()),
            CancellationToken::new(),
        );
        assert!(ctx.host_env().is_some());
        assert!(ctx.with_host_env(None).host_env().is_none());
    }
}
