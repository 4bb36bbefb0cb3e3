//! Isolated plugin loading and unloading

use crate::error::LoadError;
use crate::module::{instantiate, panic_message, ModuleError, ModuleLease, ModuleResolver};
use crate::options::PluginOptions;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use plexus_plugin_api::{Capabilities, Plugin, PluginContext, PluginError, ServiceRegistry};
use plexus_store::PluginRecord;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An active plugin
///
/// `instance` is declared before `lease`: the instance's code lives in the
/// module, so it must be dropped while the module is still resident.
struct LoadedPlugin {
    id: String,
    declared_id: String,
    name: String,
    version: String,
    module_path: PathBuf,
    capabilities: Capabilities,
    sequence: u64,
    loaded_at: DateTime<Utc>,
    instance: RwLock<Box<dyn Plugin>>,
    lease: ModuleLease,
}

/// Shared, read-only view of an active plugin
///
/// Clones keep the plugin's module resident, even after the plugin has been
/// unloaded.
#[derive(Clone)]
pub struct PluginHandle {
    inner: Arc<LoadedPlugin>,
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.inner.id)
            .field("declared_id", &self.inner.declared_id)
            .field("version", &self.inner.version)
            .field("capabilities", &self.inner.capabilities)
            .field("sequence", &self.inner.sequence)
            .finish()
    }
}

impl PluginHandle {
    /// Record id the plugin was loaded under
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Id reported by the instance itself
    pub fn declared_id(&self) -> &str {
        &self.inner.declared_id
    }

    /// Whether the instance reports a different id than its record
    pub fn has_id_mismatch(&self) -> bool {
        self.inner.id != self.inner.declared_id
    }

    /// Name reported by the instance
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Version reported by the instance
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// Module the plugin came from
    pub fn module_path(&self) -> &Path {
        &self.inner.module_path
    }

    /// Capabilities captured at load time
    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    /// Position in load order
    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    /// When initialization completed
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.inner.loaded_at
    }

    /// Run `f` against the live instance
    ///
    /// The instance is only borrowed for the duration of `f`, so callers
    /// cannot hold it across an await and stall an unload.
    pub async fn with_instance<R>(&self, f: impl FnOnce(&dyn Plugin) -> R) -> R {
        let instance = self.inner.instance.read().await;
        f(&**instance)
    }

    /// Run the plugin's installer unless it reports itself installed
    ///
    /// The instance stays read-locked while the installer runs. A panic in
    /// installer code becomes [`PluginError::Panicked`].
    pub async fn ensure_installed(
        &self,
        cancel: &CancellationToken,
    ) -> plexus_plugin_api::Result<InstallOutcome> {
        let instance = self.inner.instance.read().await;
        let installer = catch_unwind(AssertUnwindSafe(|| instance.as_installer()))
            .map_err(|payload| PluginError::panicked(panic_message(payload.as_ref())))?;
        let Some(installer) = installer else {
            return Ok(InstallOutcome::NoInstaller);
        };

        if guarded(cancel, installer.is_installed(cancel.clone())).await? {
            return Ok(InstallOutcome::AlreadyInstalled);
        }
        if !guarded(cancel, installer.install(cancel.clone())).await? {
            return Err(PluginError::init(format!(
                "installer of {} did not complete",
                self.inner.id
            )));
        }
        info!(plugin = %self.inner.id, "Plugin installed");
        Ok(InstallOutcome::Installed)
    }

    /// Run the plugin's uninstaller
    ///
    /// Returns `false` when the plugin has no installer or nothing was
    /// removed.
    pub async fn uninstall(&self, cancel: &CancellationToken) -> plexus_plugin_api::Result<bool> {
        let instance = self.inner.instance.read().await;
        let installer = catch_unwind(AssertUnwindSafe(|| instance.as_installer()))
            .map_err(|payload| PluginError::panicked(panic_message(payload.as_ref())))?;
        match installer {
            Some(installer) => guarded(cancel, installer.uninstall(cancel.clone())).await,
            None => Ok(false),
        }
    }

    /// Whether two handles refer to the same loaded instance
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn lease(&self) -> ModuleLease {
        self.inner.lease.clone()
    }

    async fn instance_mut(&self) -> RwLockWriteGuard<'_, Box<dyn Plugin>> {
        self.inner.instance.write().await
    }
}

/// Result of [`PluginHandle::ensure_installed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The plugin has no installer
    NoInstaller,
    /// The installer reported setup already done
    AlreadyInstalled,
    /// The installer ran and completed
    Installed,
}

/// Await plugin code, giving up on `cancel` and containing panics
async fn guarded<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = plexus_plugin_api::Result<T>>,
) -> plexus_plugin_api::Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PluginError::Cancelled),
        outcome = AssertUnwindSafe(future).catch_unwind() => outcome.unwrap_or_else(|payload| {
            Err(PluginError::panicked(panic_message(payload.as_ref())))
        }),
    }
}

/// Loads plugins into isolated boundaries and tracks the active set
///
/// At most one instance per record id is active. Concurrent loads of the
/// same id are serialized; the losers observe the winner's handle.
pub struct PluginLoader {
    resolver: Arc<dyn ModuleResolver>,
    services: Arc<ServiceRegistry>,
    strict_selection: bool,
    init_timeout: Duration,
    shutdown_timeout: Duration,
    active: DashMap<String, PluginHandle>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    sequence: AtomicU64,
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("resolver", &self.resolver)
            .field("active", &self.active_ids())
            .field("init_timeout", &self.init_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl PluginLoader {
    /// Create a loader
    ///
    /// `services` is handed to every plugin's `initialize`.
    pub fn new(
        resolver: Arc<dyn ModuleResolver>,
        services: Arc<ServiceRegistry>,
        options: &PluginOptions,
    ) -> Self {
        Self {
            resolver,
            services,
            strict_selection: options.strict_selection,
            init_timeout: options.init_timeout,
            shutdown_timeout: options.shutdown_timeout,
            active: DashMap::new(),
            in_flight: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Service registry shared with plugins
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Load and initialize the plugin described by `record`
    ///
    /// Returns the existing handle if the plugin is already active. On any
    /// failure the module is released and nothing becomes active.
    pub async fn load(
        &self,
        record: &PluginRecord,
        cancel: &CancellationToken,
    ) -> Result<PluginHandle, LoadError> {
        if let Some(existing) = self.get(&record.id) {
            debug!(plugin = %record.id, "Plugin already active");
            return Ok(existing);
        }

        let gate = self
            .in_flight
            .entry(record.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let guard = tokio::select! {
                guard = gate.lock() => Some(guard),
                _ = cancel.cancelled() => None,
            };
            match guard {
                None => Err(LoadError::Cancelled(record.id.clone())),
                Some(_guard) => match self.get(&record.id) {
                    Some(existing) => Ok(existing),
                    None => self.load_exclusive(record, cancel).await,
                },
            }
        };

        drop(gate);
        self.release_gate(&record.id);
        result
    }

    fn release_gate(&self, id: &str) {
        // Only the map's own reference left means nobody else is waiting.
        self.in_flight
            .remove_if(id, |_, gate| Arc::strong_count(gate) == 1);
    }

    async fn load_exclusive(
        &self,
        record: &PluginRecord,
        cancel: &CancellationToken,
    ) -> Result<PluginHandle, LoadError> {
        let path = record.module_path.as_path();
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(LoadError::ModuleNotFound(path.to_path_buf()));
        }

        info!(plugin = %record.id, path = %path.display(), "Loading plugin");

        let boundary = self.resolver.open(path).await.map_err(|e| match e {
            ModuleError::NotFound(missing) => LoadError::ModuleNotFound(missing),
            other => LoadError::InvalidModule {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        })?;

        let mut instance = {
            let factory =
                boundary
                    .select(self.strict_selection)
                    .map_err(|e| LoadError::NoPluginType {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    })?;
            instantiate(factory).map_err(|reason| LoadError::init_failed(&record.id, reason))?
        };

        let declared = catch_unwind(AssertUnwindSafe(|| instance.descriptor()))
            .map_err(|payload| LoadError::init_failed(&record.id, panic_message(payload.as_ref())))?;
        if declared.id != record.id {
            warn!(
                plugin = %record.id,
                declared = %declared.id,
                path = %path.display(),
                "Plugin declares a different id than its record"
            );
        }

        self.initialize(&record.id, instance.as_mut(), cancel).await?;

        let capabilities =
            catch_unwind(AssertUnwindSafe(|| instance.capabilities())).unwrap_or_default();

        let handle = PluginHandle {
            inner: Arc::new(LoadedPlugin {
                id: record.id.clone(),
                declared_id: declared.id,
                name: declared.name,
                version: declared.version,
                module_path: path.to_path_buf(),
                capabilities,
                sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
                loaded_at: Utc::now(),
                instance: RwLock::new(instance),
                lease: boundary.into_lease(),
            }),
        };

        let existing = match self.active.entry(record.id.clone()) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(handle.clone());
                None
            }
        };

        if let Some(existing) = existing {
            warn!(plugin = %record.id, "Plugin became active concurrently, discarding new instance");
            self.shutdown_handle(&handle, cancel).await;
            return Ok(existing);
        }

        info!(
            plugin = %record.id,
            version = %handle.version(),
            capabilities = %capabilities,
            "Plugin loaded"
        );
        Ok(handle)
    }

    async fn initialize(
        &self,
        id: &str,
        instance: &mut dyn Plugin,
        cancel: &CancellationToken,
    ) -> Result<(), LoadError> {
        let init_cancel = cancel.child_token();
        let ctx = PluginContext::new(id, Arc::clone(&self.services), init_cancel.clone());
        let init = AssertUnwindSafe(instance.initialize(ctx)).catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LoadError::Cancelled(id.to_string())),
            result = tokio::time::timeout(self.init_timeout, init) => match result {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(LoadError::init_failed(id, e)),
                Ok(Err(payload)) => Err(LoadError::init_failed(
                    id,
                    format!("initialize panicked: {}", panic_message(payload.as_ref())),
                )),
                Err(_) => Err(LoadError::init_failed(
                    id,
                    format!("initialize timed out after {:?}", self.init_timeout),
                )),
            },
        };

        if let Err(e) = &outcome {
            init_cancel.cancel();
            error!(plugin = %id, error = %e, "Plugin initialization failed");
        }
        outcome
    }

    /// Deactivate a plugin
    ///
    /// The plugin is removed from the active set before `shutdown` runs, so
    /// no new caller can reach it. Waiting for the instance and running its
    /// `shutdown` share one `shutdown_timeout` deadline and both give up
    /// when `cancel` fires. Failures are logged, never returned. Returns
    /// whether the plugin was active.
    pub async fn unload(&self, id: &str, cancel: &CancellationToken) -> bool {
        let Some((_, handle)) = self.active.remove(id) else {
            warn!(plugin = %id, "Unload requested for inactive plugin");
            return false;
        };

        info!(plugin = %id, "Unloading plugin");
        self.shutdown_handle(&handle, cancel).await;

        // The module goes away once the last handle clone is dropped.
        drop(handle);
        info!(plugin = %id, "Plugin unloaded");
        true
    }

    async fn shutdown_handle(&self, handle: &PluginHandle, cancel: &CancellationToken) {
        let id = handle.id();
        let deadline = Instant::now() + self.shutdown_timeout;

        let failure = tokio::select! {
            biased;
            _ = cancel.cancelled() => Some("shutdown cancelled".to_string()),
            acquired = tokio::time::timeout_at(deadline, handle.instance_mut()) => match acquired {
                Ok(mut instance) => self.shutdown_instance(&mut **instance, cancel, deadline).await,
                Err(_) => Some(format!(
                    "instance still in use after {:?}, shutdown skipped",
                    self.shutdown_timeout
                )),
            },
        };

        if let Some(reason) = failure {
            error!(plugin = %id, error = %reason, "Plugin shutdown failed");
        }
    }

    async fn shutdown_instance(
        &self,
        instance: &mut dyn Plugin,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Option<String> {
        let shutdown = AssertUnwindSafe(instance.shutdown(cancel.child_token())).catch_unwind();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Some("shutdown cancelled".to_string()),
            result = tokio::time::timeout_at(deadline, shutdown) => match result {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e.to_string()),
                Ok(Err(payload)) => Some(format!(
                    "shutdown panicked: {}",
                    panic_message(payload.as_ref())
                )),
                Err(_) => Some(format!("shutdown timed out after {:?}", self.shutdown_timeout)),
            },
        }
    }

    /// Unload every active plugin, most recently loaded first
    pub async fn shutdown_all(&self, cancel: &CancellationToken) -> usize {
        let mut handles = self.list_active();
        handles.reverse();
        info!(count = handles.len(), "Unloading all plugins");

        let mut unloaded = 0;
        for handle in handles {
            if self.unload(handle.id(), cancel).await {
                unloaded += 1;
            }
        }
        unloaded
    }

    /// Look up an active plugin
    pub fn get(&self, id: &str) -> Option<PluginHandle> {
        self.active.get(id).map(|entry| entry.value().clone())
    }

    /// Whether a plugin is active
    pub fn is_loaded(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    /// Snapshot of active plugins in load order
    pub fn list_active(&self) -> Vec<PluginHandle> {
        let mut handles: Vec<PluginHandle> =
            self.active.iter().map(|entry| entry.value().clone()).collect();
        handles.sort_by_key(|h| h.sequence());
        handles
    }

    /// Ids of active plugins in load order
    pub fn active_ids(&self) -> Vec<String> {
        self.list_active()
            .into_iter()
            .map(|h| h.id().to_string())
            .collect()
    }

    /// Number of active plugins
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::StaticModuleCatalog;
    use plexus_plugin_api::testing::{mock_module, Journal, MockPlugin};
    use plexus_plugin_api::PluginModule;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        catalog: Arc<StaticModuleCatalog>,
        journal: Journal,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                catalog: Arc::new(StaticModuleCatalog::new()),
                journal: Journal::new(),
            }
        }

        fn install(&self, id: &str, plugin: MockPlugin) -> PluginRecord {
            let path = self.dir.path().join(format!("{id}.so"));
            std::fs::write(&path, b"").unwrap();
            let plugin = plugin.with_journal(self.journal.clone());
            self.catalog
                .register(path.clone(), move || mock_module(plugin.clone()));
            PluginRecord::new(id, id, "1.0", path).enabled(true)
        }

        fn loader(&self) -> PluginLoader {
            self.loader_with(PluginOptions::default())
        }

        fn loader_with(&self, options: PluginOptions) -> PluginLoader {
            PluginLoader::new(
                self.catalog.clone(),
                Arc::new(ServiceRegistry::new()),
                &options,
            )
        }
    }

    #[tokio::test]
    async fn test_load_and_unload() {
        let fx = Fixture::new();
        let record = fx.install("p1", MockPlugin::new("p1"));
        let loader = fx.loader();
        let cancel = CancellationToken::new();

        let handle = loader.load(&record, &cancel).await.unwrap();
        assert_eq!(handle.id(), "p1");
        assert!(!handle.has_id_mismatch());
        assert!(loader.is_loaded("p1"));
        assert_eq!(fx.journal.count("init:p1"), 1);

        assert!(loader.unload("p1", &cancel).await);
        assert!(!loader.is_loaded("p1"));
        assert_eq!(fx.journal.count("shutdown:p1"), 1);

        // The handle still pins the module.
        assert_eq!(fx.catalog.resident_count(), 1);
        drop(handle);
        assert_eq!(fx.catalog.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let fx = Fixture::new();
        let record = fx.install("p1", MockPlugin::new("p1"));
        let loader = fx.loader();
        let cancel = CancellationToken::new();

        let first = loader.load(&record, &cancel).await.unwrap();
        let second = loader.load(&record, &cancel).await.unwrap();
        assert!(PluginHandle::ptr_eq(&first, &second));
        assert_eq!(fx.journal.count("init:p1"), 1);
        assert_eq!(fx.catalog.open_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_initialize_once() {
        let fx = Fixture::new();
        let record = fx.install(
            "p1",
            MockPlugin::new("p1").with_init_delay(Duration::from_millis(20)),
        );
        let loader = Arc::new(fx.loader());
        let cancel = CancellationToken::new();

        let attempts = (0..8).map(|_| {
            let loader = Arc::clone(&loader);
            let record = record.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { loader.load(&record, &cancel).await })
        });
        let handles: Vec<PluginHandle> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert!(handles.iter().all(|h| PluginHandle::ptr_eq(h, &handles[0])));
        assert_eq!(fx.journal.count("init:p1"), 1);
        assert_eq!(loader.active_count(), 1);
        assert!(loader.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_missing_module() {
        let fx = Fixture::new();
        let record = PluginRecord::new("ghost", "Ghost", "1.0", fx.dir.path().join("ghost.so"));
        let loader = fx.loader();

        let err = loader.load(&record, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LoadError::ModuleNotFound(_)));
        assert_eq!(loader.active_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_module_and_no_plugin_type() {
        let fx = Fixture::new();
        let loader = fx.loader();
        let cancel = CancellationToken::new();

        let junk = fx.dir.path().join("junk.so");
        std::fs::write(&junk, b"junk").unwrap();
        let err = loader
            .load(&PluginRecord::new("junk", "Junk", "1", &junk), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidModule { .. }));

        let empty = fx.dir.path().join("empty.so");
        std::fs::write(&empty, b"").unwrap();
        fx.catalog.register(empty.clone(), PluginModule::new);
        let err = loader
            .load(&PluginRecord::new("empty", "Empty", "1", &empty), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::NoPluginType { .. }));
        assert_eq!(fx.catalog.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_nothing_active() {
        let fx = Fixture::new();
        let record = fx.install("bad", MockPlugin::new("bad").failing_init());
        let loader = fx.loader();

        let err = loader.load(&record, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LoadError::InitializationFailed { .. }));
        assert!(!loader.is_loaded("bad"));
        assert_eq!(fx.catalog.resident_count(), 0);
        assert_eq!(fx.journal.count("shutdown:bad"), 0);
    }

    #[tokio::test]
    async fn test_initialize_timeout() {
        let fx = Fixture::new();
        let record = fx.install(
            "slow",
            MockPlugin::new("slow").with_init_delay(Duration::from_secs(60)),
        );
        let loader = fx.loader_with(PluginOptions {
            init_timeout: Duration::from_millis(20),
            ..PluginOptions::default()
        });

        let err = loader.load(&record, &CancellationToken::new()).await.unwrap_err();
        match err {
            LoadError::InitializationFailed { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.catalog.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_load() {
        let fx = Fixture::new();
        let record = fx.install(
            "slow",
            MockPlugin::new("slow").with_init_delay(Duration::from_secs(60)),
        );
        let loader = fx.loader();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = loader.load(&record, &cancel).await.unwrap_err();
        assert!(matches!(err, LoadError::Cancelled(_)));
        assert!(!loader.is_loaded("slow"));
    }

    #[tokio::test]
    async fn test_id_mismatch_is_observable() {
        let fx = Fixture::new();
        let record = fx.install("record-id", MockPlugin::new("declared-id"));
        let loader = fx.loader();

        let handle = loader.load(&record, &CancellationToken::new()).await.unwrap();
        assert_eq!(handle.id(), "record-id");
        assert_eq!(handle.declared_id(), "declared-id");
        assert!(handle.has_id_mismatch());
        assert!(loader.get("record-id").is_some());
        assert!(loader.get("declared-id").is_none());
    }

    #[tokio::test]
    async fn test_unload_absent_is_noop() {
        let fx = Fixture::new();
        let loader = fx.loader();
        assert!(!loader.unload("nobody", &CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn test_shutdown_failure_is_swallowed() {
        let fx = Fixture::new();
        let record = fx.install("p1", MockPlugin::new("p1").failing_shutdown());
        let loader = fx.loader();
        let cancel = CancellationToken::new();

        loader.load(&record, &cancel).await.unwrap();
        assert!(loader.unload("p1", &cancel).await);
        assert!(!loader.is_loaded("p1"));
        assert_eq!(fx.catalog.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_all_reverse_order() {
        let fx = Fixture::new();
        let loader = fx.loader();
        let cancel = CancellationToken::new();

        for id in ["a", "b", "c"] {
            let record = fx.install(id, MockPlugin::new(id));
            loader.load(&record, &cancel).await.unwrap();
        }
        assert_eq!(loader.active_ids(), vec!["a", "b", "c"]);

        assert_eq!(loader.shutdown_all(&cancel).await, 3);
        assert_eq!(
            fx.journal.matching("shutdown:"),
            vec!["shutdown:c", "shutdown:b", "shutdown:a"]
        );
        assert_eq!(loader.active_count(), 0);
    }

    #[tokio::test]
    async fn test_capabilities_cached() {
        let fx = Fixture::new();
        let record = fx.install(
            "worker",
            MockPlugin::new("worker").with_background_work().contributing_services(),
        );
        let loader = fx.loader();

        let handle = loader.load(&record, &CancellationToken::new()).await.unwrap();
        assert!(handle.capabilities().background_work);
        assert!(handle.capabilities().service_contribution);
        assert_eq!(handle.with_instance(|p| p.id().to_string()).await, "worker");
    }

    #[tokio::test]
    async fn test_unload_gives_up_on_busy_instance() {
        let fx = Fixture::new();
        let record = fx.install("p1", MockPlugin::new("p1"));
        let loader = Arc::new(fx.loader_with(PluginOptions {
            shutdown_timeout: Duration::from_millis(50),
            ..PluginOptions::default()
        }));
        let cancel = CancellationToken::new();

        let handle = loader.load(&record, &cancel).await.unwrap();
        let busy = handle.inner.instance.read().await;

        let unloaded = tokio::time::timeout(Duration::from_secs(2), loader.unload("p1", &cancel))
            .await
            .unwrap();
        assert!(unloaded);
        assert!(!loader.is_loaded("p1"));
        assert_eq!(fx.journal.count("shutdown:p1"), 0);
        drop(busy);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_unload_wait() {
        let fx = Fixture::new();
        let record = fx.install("p1", MockPlugin::new("p1"));
        let loader = fx.loader_with(PluginOptions {
            shutdown_timeout: Duration::from_secs(60),
            ..PluginOptions::default()
        });

        let handle = loader.load(&record, &CancellationToken::new()).await.unwrap();
        let busy = handle.inner.instance.read().await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let unloaded = tokio::time::timeout(Duration::from_secs(2), loader.unload("p1", &cancel))
            .await
            .unwrap();
        assert!(unloaded);
        drop(busy);
    }

    #[tokio::test]
    async fn test_with_instance_does_not_block_unload() {
        let fx = Fixture::new();
        let record = fx.install("p1", MockPlugin::new("p1"));
        let loader = fx.loader();
        let cancel = CancellationToken::new();

        let handle = loader.load(&record, &cancel).await.unwrap();
        let name = handle.with_instance(|p| p.name().to_string()).await;
        assert_eq!(name, "Mock p1");

        assert!(loader.unload("p1", &cancel).await);
        assert_eq!(fx.journal.count("shutdown:p1"), 1);
    }

    #[tokio::test]
    async fn test_ensure_installed_runs_installer_once() {
        let fx = Fixture::new();
        let mock = MockPlugin::new("p1").with_installer();
        let record = fx.install("p1", mock.clone());
        let loader = fx.loader();
        let cancel = CancellationToken::new();

        let handle = loader.load(&record, &cancel).await.unwrap();
        assert!(handle.capabilities().installer);
        assert_eq!(
            handle.ensure_installed(&cancel).await.unwrap(),
            InstallOutcome::Installed
        );
        assert_eq!(
            handle.ensure_installed(&cancel).await.unwrap(),
            InstallOutcome::AlreadyInstalled
        );
        assert_eq!(fx.journal.count("install:p1"), 1);
        assert!(mock.is_installed_now());

        assert!(handle.uninstall(&cancel).await.unwrap());
        assert!(!mock.is_installed_now());
    }

    #[tokio::test]
    async fn test_ensure_installed_without_installer() {
        let fx = Fixture::new();
        let record = fx.install("p1", MockPlugin::new("p1"));
        let loader = fx.loader();
        let cancel = CancellationToken::new();

        let handle = loader.load(&record, &cancel).await.unwrap();
        assert_eq!(
            handle.ensure_installed(&cancel).await.unwrap(),
            InstallOutcome::NoInstaller
        );
        assert!(!handle.uninstall(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_installed_reports_failure_and_cancellation() {
        let fx = Fixture::new();
        let record = fx.install("bad", MockPlugin::new("bad").failing_install());
        let loader = fx.loader();
        let cancel = CancellationToken::new();

        let handle = loader.load(&record, &cancel).await.unwrap();
        assert!(matches!(
            handle.ensure_installed(&cancel).await,
            Err(PluginError::InitError(_))
        ));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(handle.ensure_installed(&cancelled).await.unwrap_err().is_cancelled());
    }
}
