//! Background work capability

use crate::boundary::HostEnv;
use crate::error::{PluginError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Capability for plugins that contribute long-running tasks
pub trait BackgroundWork: Send + Sync {
    /// Tasks to start after the plugin is loaded
    ///
    /// Called once per host start. Every call should hand out fresh tasks.
    fn background_tasks(&self) -> Vec<Box<dyn BackgroundTask>>;
}

/// A supervised unit of background work
///
/// `start` must return once the work is running; it must not block for the
/// lifetime of the work.
#[async_trait]
pub trait BackgroundTask: Send + Sync + fmt::Debug {
    /// Task name used in logs
    fn name(&self) -> &str;

    /// Start the task
    async fn start(&mut self, cancel: CancellationToken) -> Result<()>;

    /// Stop the task and wait for it to wind down
    async fn stop(&mut self, cancel: CancellationToken) -> Result<()>;
}

/// A long-running loop that runs until `stopping` fires
///
/// Wrap it in [`ServiceTask`] to obtain a [`BackgroundTask`].
#[async_trait]
pub trait BackgroundService: Send + Sync + 'static {
    /// Service name used in logs
    fn name(&self) -> &str;

    /// Run until `stopping` is cancelled
    async fn execute(&self, stopping: CancellationToken) -> Result<()>;
}

/// Adapter that runs a [`BackgroundService`] on the host runtime
///
/// The loop is spawned through the [`HostEnv`] current at `start`, so it
/// runs on the host's runtime even when the service lives in a shared
/// library.
pub struct ServiceTask<S: BackgroundService> {
    service: Arc<S>,
    name: String,
    stopping: Option<CancellationToken>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl<S: BackgroundService> fmt::Debug for ServiceTask<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<S: BackgroundService> ServiceTask<S> {
    /// Wrap a service
    pub fn new(service: S) -> Self {
        Self::from_arc(Arc::new(service))
    }

    /// Wrap a shared service
    pub fn from_arc(service: Arc<S>) -> Self {
        let name = service.name().to_string();
        Self {
            service,
            name,
            stopping: None,
            handle: None,
        }
    }

    /// Whether the service loop has been spawned and not yet stopped
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Boxed form, ready to return from [`BackgroundWork::background_tasks`]
    pub fn boxed(self) -> Box<dyn BackgroundTask> {
        Box::new(self)
    }
}

#[async_trait]
impl<S: BackgroundService> BackgroundTask for ServiceTask<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        if self.handle.is_some() {
            return Err(PluginError::invalid_state(format!(
                "service {} is already running",
                self.name
            )));
        }
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        let env = HostEnv::current().ok_or_else(|| {
            PluginError::runtime(format!("no tokio runtime to run service {} on", self.name))
        })?;

        let stopping = CancellationToken::new();
        let service = Arc::clone(&self.service);
        let token = stopping.clone();
        let name = self.name.clone();

        let handle = env.spawn(async move {
            debug!(service = %name, "Background service loop entered");
            let outcome = service.execute(token).await;
            match &outcome {
                Ok(()) => info!(service = %name, "Background service exited"),
                Err(e) => error!(service = %name, error = %e, "Background service failed"),
            }
            outcome
        });

        self.stopping = Some(stopping);
        self.handle = Some(handle);
        Ok(())
    }

    async fn stop(&mut self, cancel: CancellationToken) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if let Some(stopping) = self.stopping.take() {
            stopping.cancel();
        }

        let abort = handle.abort_handle();
        tokio::select! {
            joined = handle => match joined {
                Ok(Err(PluginError::Panicked(reason))) => Err(PluginError::task(format!(
                    "service {} panicked: {reason}",
                    self.name
                ))),
                Ok(_) => Ok(()),
                Err(e) => Err(PluginError::task(format!(
                    "service {} terminated abnormally: {e}",
                    self.name
                ))),
            },
            _ = cancel.cancelled() => {
                abort.abort();
                Err(PluginError::Cancelled)
            }
        }
    }
}
