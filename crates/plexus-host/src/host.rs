//! Plugin host composition

use crate::error::{HostError, Result};
use crate::shutdown::ShutdownSignal;
use crate::HostState;
use plexus_config::{Config, StorageConfig};
use plexus_plugin_api::{ServiceContribution, ServiceRegistry};
use plexus_plugin_runtime::module::panic_message;
use plexus_plugin_runtime::{
    BackgroundTaskSupervisor, DirectoryWatcher, DynamicLibraryResolver, EventBus, ModuleResolver, PluginDiscovery, PluginHandle, PluginLoader, PluginOptions, PluginRegistry,
    PluginRuntimeError,
};
use plexus_store::{InMemoryRepository, JsonFileRepository, MetadataRepository, PluginRecord};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of [`PluginHost::start`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartReport {
    /// Records known after discovery
    pub discovered: usize,
    /// Enabled plugins activated
    pub loaded: usize,
    /// Enabled plugins that failed to load
    pub failed: usize,
    /// Plugins whose service contributions were applied
    pub services_configured: usize,
    /// Background tasks started
    pub tasks_started: usize,
}

#[derive(Debug)]
struct WatcherRuntime {
    watcher: DirectoryWatcher,
    forward: JoinHandle<()>,
}

#[derive(Debug)]
struct HostInner {
    options: PluginOptions,
    discovery: Arc<PluginDiscovery>,
    registry: PluginRegistry,
    loader: Arc<PluginLoader>,
    supervisor: BackgroundTaskSupervisor,
    event_bus: EventBus,
    services: Arc<ServiceRegistry>,
    shutdown: ShutdownSignal,
    state: parking_lot::RwLock<HostState>,
    watch: bool,
    watcher: tokio::sync::Mutex<Option<WatcherRuntime>>,
}

/// Wires discovery, registry, loader, event bus and supervisor together
///
/// Cloning is cheap; clones share one host.
#[derive(Debug, Clone)]
pub struct PluginHost {
    inner: Arc<HostInner>,
}

impl PluginHost {
    /// Create a new host builder
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    /// Get the current state
    pub fn state(&self) -> HostState {
        *self.inner.state.read()
    }

    /// Effective plugin options
    pub fn options(&self) -> &PluginOptions {
        &self.inner.options
    }

    /// Discovery service
    pub fn discovery(&self) -> &Arc<PluginDiscovery> {
        &self.inner.discovery
    }

    /// Registry facade
    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    /// Loader and active set
    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.inner.loader
    }

    /// Background task supervisor
    pub fn supervisor(&self) -> &BackgroundTaskSupervisor {
        &self.inner.supervisor
    }

    /// Process-wide event bus, also registered in [`services`](Self::services)
    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    /// Host service registry handed to plugins
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.inner.services
    }

    /// Get shutdown signal
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.shutdown.clone()
    }

    /// Scan the plugin directory and reconcile records
    pub async fn discover(&self) -> Result<Vec<PluginRecord>> {
        let cancel = self.inner.shutdown.token();
        Ok(self.inner.discovery.discover(&cancel).await?)
    }

    /// Bring the host up
    ///
    /// Discovers modules, loads every enabled plugin, applies service
    /// contributions and starts background tasks. A plugin that fails to
    /// load is logged and counted; the others still start. If startup
    /// itself fails everything already activated is torn down again.
    ///
    /// A stopped host can be started again; a shutdown signal left over from
    /// the previous run is cleared first.
    pub async fn start(&self) -> Result<StartReport> {
        let previous =
            self.transition(&[HostState::Created, HostState::Stopped], HostState::Starting)?;
        if previous == HostState::Stopped && self.inner.shutdown.rearm() {
            debug!("Cleared shutdown signal from the previous run");
        }
        info!(directory = %self.inner.options.directory.display(), "Starting plugin host");

        match self.start_components().await {
            Ok(report) => {
                *self.inner.state.write() = HostState::Running;
                info!(
                    discovered = report.discovered,
                    loaded = report.loaded,
                    failed = report.failed,
                    tasks = report.tasks_started,
                    "Plugin host running"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Plugin host failed to start");
                self.teardown().await;
                *self.inner.state.write() = HostState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_components(&self) -> Result<StartReport> {
        let cancel = self.inner.shutdown.token();

        let records = self.inner.discovery.discover(&cancel).await?;
        let mut report = StartReport {
            discovered: records.len(),
            ..StartReport::default()
        };

        for record in self.inner.registry.list_enabled().await? {
            match self.inner.load_installed(&record, &cancel).await {
                Ok(_) => report.loaded += 1,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(plugin = %record.id, error = %e, "Failed to load plugin");
                    report.failed += 1;
                }
            }
        }

        report.services_configured = self.apply_service_contributions().await;
        report.tasks_started = self.inner.supervisor.start(&cancel).await?;

        if self.inner.watch {
            self.start_watcher().await?;
        }

        Ok(report)
    }

    /// Bring the host down
    ///
    /// Stops background tasks in reverse start order, then unloads every
    /// plugin in reverse load order.
    pub async fn stop(&self) -> Result<()> {
        self.transition(&[HostState::Running], HostState::Stopping)?;
        info!("Stopping plugin host");

        self.teardown().await;

        *self.inner.state.write() = HostState::Stopped;
        info!("Plugin host stopped");
        Ok(())
    }

    async fn teardown(&self) {
        self.stop_watcher().await;

        // Shutdown must run to completion even after the signal fired.
        let cancel = CancellationToken::new();
        let stopped = self.inner.supervisor.stop(&cancel).await;
        let unloaded = self.inner.loader.shutdown_all(&cancel).await;
        debug!(tasks = stopped, plugins = unloaded, "Teardown complete");
    }

    /// Start, wait for the shutdown signal, then stop
    pub async fn run_until_shutdown(&self) -> Result<StartReport> {
        let report = self.start().await?;
        self.inner.shutdown.wait().await;
        info!("Shutdown requested");
        self.stop().await?;
        Ok(report)
    }

    /// Let every active plugin register its services
    ///
    /// Returns the number of plugins whose contribution succeeded. Failures
    /// are logged per plugin.
    pub async fn apply_service_contributions(&self) -> usize {
        let mut configured = 0;
        for handle in self.inner.loader.list_active() {
            if contribute_services(&handle, &self.inner.services).await {
                configured += 1;
            }
        }
        configured
    }

    /// Let every active plugin wire itself into a request pipeline
    ///
    /// Called by the layer that embeds the host, with its own pipeline
    /// value; plugins downcast it to the type they target. Plugins are
    /// visited in load order. Returns the number of plugins whose
    /// contribution succeeded.
    pub async fn configure_pipeline<P: Any>(&self, pipeline: &mut P) -> usize {
        let mut configured = 0;
        for handle in self.inner.loader.list_active() {
            let applied = contribute(&handle, "Pipeline", |contribution| {
                contribution.configure_pipeline(&mut *pipeline)
            })
            .await;
            if applied {
                configured += 1;
            }
        }
        configured
    }

    /// Mark a plugin enabled and, if the host is running, activate it
    ///
    /// Returns the handle when the plugin was activated.
    pub async fn enable_plugin(&self, id: &str) -> Result<Option<PluginHandle>> {
        if !self.inner.registry.set_enabled(id, true).await? {
            return Err(PluginRuntimeError::not_found(id).into());
        }
        info!(plugin = %id, "Plugin enabled");

        if self.state() != HostState::Running {
            return Ok(None);
        }

        let record = self
            .inner
            .registry
            .get_by_id(id)
            .await?
            .ok_or_else(|| PluginRuntimeError::not_found(id))?;
        let handle = self
            .inner
            .activate(&record, &self.inner.shutdown.token())
            .await?;
        Ok(Some(handle))
    }

    /// Mark a plugin disabled and deactivate it
    ///
    /// Returns `true` if an active instance was unloaded.
    pub async fn disable_plugin(&self, id: &str) -> Result<bool> {
        if !self.inner.registry.set_enabled(id, false).await? {
            return Err(PluginRuntimeError::not_found(id).into());
        }
        info!(plugin = %id, "Plugin disabled");

        let cancel = CancellationToken::new();
        self.inner.supervisor.stop_plugin(id, &cancel).await;
        Ok(self.inner.loader.unload(id, &cancel).await)
    }

    /// Run a plugin's uninstaller, then disable and unload it
    ///
    /// A plugin that is not active is loaded just for the uninstaller.
    /// Returns what the uninstaller reported: `false` when the plugin has no
    /// installer or there was nothing to remove.
    pub async fn uninstall_plugin(&self, id: &str) -> Result<bool> {
        let record = self
            .inner
            .registry
            .get_by_id(id)
            .await?
            .ok_or_else(|| PluginRuntimeError::not_found(id))?;

        let token = self.inner.shutdown.token();
        let handle = match self.inner.loader.get(id) {
            Some(handle) => handle,
            None => self.inner.loader.load(&record, &token).await?,
        };

        let cancel = CancellationToken::new();
        self.inner.supervisor.stop_plugin(id, &cancel).await;
        let uninstalled = handle.uninstall(&token).await;
        drop(handle);
        self.inner.loader.unload(id, &cancel).await;

        let removed = uninstalled.map_err(|source| HostError::Install {
            id: id.to_string(),
            source,
        })?;
        self.inner.registry.set_enabled(id, false).await?;
        info!(plugin = %id, removed, "Plugin uninstalled");
        Ok(removed)
    }

    /// Inspect and record one module file
    ///
    /// If the host is running and the record comes out enabled, the plugin
    /// is activated as well.
    pub async fn register_plugin(&self, path: impl AsRef<Path>) -> Result<PluginRecord> {
        let cancel = self.inner.shutdown.token();
        let record = self
            .inner
            .discovery
            .register_from_path(path.as_ref(), &cancel)
            .await?;

        if record.enabled && self.state() == HostState::Running {
            self.inner.activate(&record, &cancel).await?;
        }
        Ok(record)
    }

    /// Move to `to` if the current state is one of `from`; returns the old state
    fn transition(&self, from: &[HostState], to: HostState) -> Result<HostState> {
        let mut state = self.inner.state.write();
        if !from.contains(&*state) {
            return Err(HostError::InvalidState(format!(
                "cannot move from {} to {}",
                *state, to
            )));
        }
        Ok(std::mem::replace(&mut *state, to))
    }

    async fn start_watcher(&self) -> Result<()> {
        let mut slot = self.inner.watcher.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let mut watcher = DirectoryWatcher::new(Arc::clone(&self.inner.discovery));
        let mut records = watcher.start().await?;

        let inner = Arc::clone(&self.inner);
        let forward = tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                if !record.enabled {
                    debug!(plugin = %record.id, "New plugin recorded as disabled");
                    continue;
                }
                let cancel = inner.shutdown.token();
                if let Err(e) = inner.activate(&record, &cancel).await {
                    error!(plugin = %record.id, error = %e, "Failed to activate watched plugin");
                }
            }
        });

        *slot = Some(WatcherRuntime { watcher, forward });
        Ok(())
    }

    async fn stop_watcher(&self) {
        let runtime = self.inner.watcher.lock().await.take();
        if let Some(mut runtime) = runtime {
            runtime.watcher.stop().await;
            if let Err(e) = runtime.forward.await {
                warn!(error = %e, "Watcher forwarding task ended abnormally");
            }
        }
    }
}

impl HostInner {
    /// Load one plugin and run its installer if it is not installed yet
    ///
    /// A plugin whose installer fails is unloaded again.
    async fn load_installed(
        &self,
        record: &PluginRecord,
        cancel: &CancellationToken,
    ) -> Result<PluginHandle> {
        let handle = self.loader.load(record, cancel).await?;
        match handle.ensure_installed(cancel).await {
            Ok(outcome) => {
                debug!(plugin = %record.id, ?outcome, "Install check complete");
                Ok(handle)
            }
            Err(source) => {
                error!(plugin = %record.id, error = %source, "Plugin installer failed");
                drop(handle);
                self.loader.unload(&record.id, &CancellationToken::new()).await;
                Err(HostError::Install {
                    id: record.id.clone(),
                    source,
                })
            }
        }
    }

    /// Load one plugin, apply its services and start its tasks
    async fn activate(
        &self,
        record: &PluginRecord,
        cancel: &CancellationToken,
    ) -> Result<PluginHandle> {
        let handle = self.load_installed(record, cancel).await?;
        contribute_services(&handle, &self.services).await;
        self.supervisor.start_plugin(&handle, cancel).await?;
        Ok(handle)
    }
}

async fn contribute_services(handle: &PluginHandle, services: &ServiceRegistry) -> bool {
    contribute(handle, "Service", |contribution| {
        contribution.configure_services(services)
    })
    .await
}

/// Run one [`ServiceContribution`] hook of an active plugin
///
/// Returns whether the plugin contributed successfully. Errors and panics
/// are logged.
async fn contribute<F>(handle: &PluginHandle, kind: &'static str, f: F) -> bool
where
    F: FnOnce(&dyn ServiceContribution) -> plexus_plugin_api::Result<()>,
{
    if !handle.capabilities().service_contribution {
        return false;
    }

    let outcome = handle
        .with_instance(|instance| {
            catch_unwind(AssertUnwindSafe(|| instance.as_service_contribution().map(f)))
        })
        .await;

    match outcome {
        Ok(Some(Ok(()))) => {
            debug!(plugin = %handle.id(), kind, "Contributions applied");
            true
        }
        Ok(None) => false,
        Ok(Some(Err(e))) => {
            error!(plugin = %handle.id(), kind, error = %e, "Contribution failed");
            false
        }
        Err(payload) => {
            error!(
                plugin = %handle.id(),
                kind,
                error = %panic_message(payload.as_ref()),
                "Contribution panicked"
            );
            false
        }
    }
}

/// Host builder
#[derive(Default)]
pub struct HostBuilder {
    config: Option<Config>,
    options: Option<PluginOptions>,
    resolver: Option<Arc<dyn ModuleResolver>>,
    repository: Option<Arc<dyn MetadataRepository>>,
    services: Option<Arc<ServiceRegistry>>,
    watch: Option<bool>,
}

impl fmt::Debug for HostBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuilder")
            .field("config", &self.config)
            .field("options", &self.options)
            .field("resolver", &self.resolver)
            .field("has_repository", &self.repository.is_some())
            .field("watch", &self.watch)
            .finish_non_exhaustive()
    }
}

impl HostBuilder {
    /// Create a new host builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the plugin options derived from the configuration
    pub fn options(mut self, options: PluginOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Use a specific module resolver (default: shared libraries)
    pub fn resolver(mut self, resolver: Arc<dyn ModuleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Use a specific metadata repository instead of the configured storage
    pub fn repository(mut self, repository: Arc<dyn MetadataRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Share an existing service registry with plugins
    pub fn services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = Some(services);
        self
    }

    /// Enable/disable the plugin directory watcher
    pub fn watch(mut self, enable: bool) -> Self {
        self.watch = Some(enable);
        self
    }

    /// Build the host
    pub fn build(self) -> Result<PluginHost> {
        let config = self.config.unwrap_or_default();
        let options = self.options.unwrap_or_else(|| config.plugin_options());
        let watch = self.watch.unwrap_or(config.plugins.watch);

        let repository: Arc<dyn MetadataRepository> = match self.repository {
            Some(repository) => repository,
            None => match &config.storage {
                StorageConfig::Memory => Arc::new(InMemoryRepository::new()),
                StorageConfig::Json { path } => Arc::new(JsonFileRepository::open(path)?),
            },
        };
        let resolver: Arc<dyn ModuleResolver> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(DynamicLibraryResolver::new()),
        };
        let services = self.services.unwrap_or_default();

        let event_bus = EventBus::new();
        services.insert(Arc::new(event_bus.clone()));

        let discovery = Arc::new(PluginDiscovery::new(
            options.clone(),
            Arc::clone(&resolver),
            Arc::clone(&repository),
        ));
        let registry = PluginRegistry::new(repository);
        let loader = Arc::new(PluginLoader::new(resolver, Arc::clone(&services), &options));
        let supervisor = BackgroundTaskSupervisor::new(Arc::clone(&loader));

        debug!(
            backend = registry.repository().backend_name(),
            watch,
            "Plugin host built"
        );

        Ok(PluginHost {
            inner: Arc::new(HostInner {
                options,
                discovery,
                registry,
                loader,
                supervisor,
                event_bus,
                services,
                shutdown: ShutdownSignal::new(),
                state: parking_lot::RwLock::new(HostState::Created),
                watch,
                watcher: tokio::sync::Mutex::new(None),
            }),
        })
    }
}
