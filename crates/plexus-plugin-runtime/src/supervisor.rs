//! Background task supervision

use crate::error::{PluginRuntimeError, Result};
use crate::loader::{PluginHandle, PluginLoader};
use crate::module::{panic_message, ModuleLease};
use futures::FutureExt;
use plexus_plugin_api::BackgroundTask;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A task that started successfully
///
/// `task` is declared before `lease` so the task is dropped while its
/// module is still resident.
struct SupervisedTask {
    plugin_id: String,
    name: String,
    task: Box<dyn BackgroundTask>,
    _lease: ModuleLease,
}

/// Identity of a running background task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedTask {
    /// Owning plugin
    pub plugin_id: String,
    /// Task name
    pub name: String,
}

/// Starts plugin background tasks and stops them in reverse order
pub struct BackgroundTaskSupervisor {
    loader: Arc<PluginLoader>,
    started: Mutex<Vec<SupervisedTask>>,
}

impl fmt::Debug for BackgroundTaskSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTaskSupervisor")
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

impl BackgroundTaskSupervisor {
    /// Create a supervisor over the loader's active set
    pub fn new(loader: Arc<PluginLoader>) -> Self {
        Self {
            loader,
            started: Mutex::new(Vec::new()),
        }
    }

    /// Start the tasks of every active plugin with background work
    ///
    /// Plugins are visited in load order and each plugin's tasks in the
    /// order it returns them. A task that fails to start is logged and
    /// skipped. Plugins that already have running tasks are skipped.
    /// Returns the number of tasks started by this call; if
    /// `cancel` fires, the remaining tasks are not started and the ones
    /// already running stay recorded for [`stop`](Self::stop).
    pub async fn start(&self, cancel: &CancellationToken) -> Result<usize> {
        let mut started = self.started.lock().await;
        let before = started.len();

        for handle in self.loader.list_active() {
            if started.iter().any(|t| t.plugin_id == handle.id()) {
                continue;
            }
            Self::start_handle(&mut started, &handle, cancel).await?;
        }

        Ok(started.len() - before)
    }

    /// Start the tasks of one plugin
    ///
    /// Used when a plugin is activated after [`start`](Self::start). A plugin
    /// that already has running tasks is left alone.
    pub async fn start_plugin(
        &self,
        handle: &PluginHandle,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut started = self.started.lock().await;
        if started.iter().any(|t| t.plugin_id == handle.id()) {
            debug!(plugin = %handle.id(), "Background tasks already running");
            return Ok(0);
        }
        let before = started.len();
        Self::start_handle(&mut started, handle, cancel).await?;
        Ok(started.len() - before)
    }

    async fn start_handle(
        started: &mut Vec<SupervisedTask>,
        handle: &PluginHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !handle.capabilities().background_work {
            return Ok(());
        }

        let tasks = handle
            .with_instance(|instance| {
                catch_unwind(AssertUnwindSafe(|| {
                    instance.as_background_work().map(|work| work.background_tasks())
                }))
            })
            .await;
        let tasks = match tasks {
            Ok(Some(tasks)) => tasks,
            Ok(None) => return Ok(()),
            Err(payload) => {
                error!(
                    plugin = %handle.id(),
                    error = %panic_message(payload.as_ref()),
                    "Listing background tasks panicked"
                );
                return Ok(());
            }
        };
        debug!(plugin = %handle.id(), count = tasks.len(), "Starting background tasks");

        for mut task in tasks {
            if cancel.is_cancelled() {
                warn!(plugin = %handle.id(), "Background task start cancelled");
                return Err(PluginRuntimeError::Cancelled);
            }

            let name = task.name().to_string();
            let outcome = AssertUnwindSafe(task.start(cancel.child_token()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {
                    info!(plugin = %handle.id(), task = %name, "Background task started");
                    started.push(SupervisedTask {
                        plugin_id: handle.id().to_string(),
                        name,
                        task,
                        _lease: handle.lease(),
                    });
                }
                Ok(Err(e)) => {
                    error!(
                        plugin = %handle.id(),
                        task = %name,
                        error = %e,
                        "Background task failed to start"
                    );
                }
                Err(payload) => {
                    error!(
                        plugin = %handle.id(),
                        task = %name,
                        error = %panic_message(payload.as_ref()),
                        "Background task panicked while starting"
                    );
                }
            }
        }
        Ok(())
    }

    /// Stop every started task in exact reverse start order
    ///
    /// Failures are logged and the remaining tasks still stop. The started
    /// list is always empty afterwards. Returns the number of tasks that
    /// stopped cleanly.
    pub async fn stop(&self, cancel: &CancellationToken) -> usize {
        let tasks = std::mem::take(&mut *self.started.lock().await);
        info!(count = tasks.len(), "Stopping background tasks");
        Self::stop_tasks(tasks, cancel).await
    }

    /// Stop one plugin's tasks in reverse start order
    pub async fn stop_plugin(&self, plugin_id: &str, cancel: &CancellationToken) -> usize {
        let tasks = {
            let mut started = self.started.lock().await;
            let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *started)
                .into_iter()
                .partition(|t| t.plugin_id == plugin_id);
            *started = rest;
            mine
        };
        if tasks.is_empty() {
            return 0;
        }
        debug!(plugin = %plugin_id, count = tasks.len(), "Stopping plugin background tasks");
        Self::stop_tasks(tasks, cancel).await
    }

    async fn stop_tasks(tasks: Vec<SupervisedTask>, cancel: &CancellationToken) -> usize {
        let mut stopped = 0;
        for mut supervised in tasks.into_iter().rev() {
            let outcome = AssertUnwindSafe(supervised.task.stop(cancel.child_token()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {
                    debug!(
                        plugin = %supervised.plugin_id,
                        task = %supervised.name,
                        "Background task stopped"
                    );
                    stopped += 1;
                }
                Ok(Err(e)) => error!(
                    plugin = %supervised.plugin_id,
                    task = %supervised.name,
                    error = %e,
                    "Background task failed to stop"
                ),
                Err(payload) => error!(
                    plugin = %supervised.plugin_id,
                    task = %supervised.name,
                    error = %panic_message(payload.as_ref()),
                    "Background task panicked while stopping"
                ),
            }
        }
        stopped
    }

    /// Number of running tasks
    pub async fn started_count(&self) -> usize {
        self.started.lock().await.len()
    }

    /// Running tasks in start order
    pub async fn started_tasks(&self) -> Vec<StartedTask> {
        self.started
            .lock()
            .await
            .iter()
            .map(|t| StartedTask {
                plugin_id: t.plugin_id.clone(),
                name: t.name.clone(),
            })
            .collect()
    }
}
