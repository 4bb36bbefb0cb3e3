//! Module isolation boundaries
//!
//! A [`ModuleResolver`] turns a module path into a [`ModuleBoundary`]: the
//! factories the module exports plus a [`ModuleLease`] that keeps the module's
//! code resident. Every plugin instance and background task created from a
//! boundary holds a lease clone, so the code is only released once the last of
//! them is dropped.

use async_trait::async_trait;
use parking_lot::RwLock;
pub use plexus_plugin_api::boundary::panic_message;

use plexus_plugin_api::{
    Plugin, PluginEntryFn, PluginFactory, PluginModule, API_VERSION_SYMBOL, ENTRY_SYMBOL,
    PLUGIN_API_VERSION,
};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Failure to open a module
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// Nothing exists at the path
    #[error("module not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file is not a loadable plugin module
    #[error("{reason}")]
    Invalid {
        /// Module path
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// The module targets another plugin API revision
    #[error("module targets plugin API {found}, host speaks {expected}")]
    ApiMismatch {
        /// Module path
        path: PathBuf,
        /// Revision reported by the module
        found: u32,
        /// Revision of the host
        expected: u32,
    },
}

impl ModuleError {
    fn invalid(path: &Path, reason: impl fmt::Display) -> Self {
        Self::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Why no factory could be selected from a module
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// The module exports no plugin type
    #[error("module exports no plugin type")]
    Empty,

    /// Several types and strict selection is on
    #[error("module exports several plugin types: {}", .0.join(", "))]
    Ambiguous(Vec<String>),
}

/// Keeps a module's code resident while held
///
/// Cloning is cheap. The module is released when the last clone is dropped.
#[derive(Clone)]
pub struct ModuleLease {
    path: Arc<PathBuf>,
    _guard: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for ModuleLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLease")
            .field("path", &self.path)
            .field("holders", &Arc::strong_count(&self._guard))
            .finish()
    }
}

impl ModuleLease {
    /// Wrap any value whose lifetime pins the module
    pub fn new(path: impl Into<PathBuf>, guard: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            path: Arc::new(path.into()),
            _guard: guard,
        }
    }

    /// Module path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// An opened module: its factories and the lease pinning them
///
/// `module` is declared before `lease` so the factories, whose code lives in
/// the module, are dropped first.
pub struct ModuleBoundary {
    module: PluginModule,
    lease: ModuleLease,
}

impl fmt::Debug for ModuleBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBoundary")
            .field("path", &self.lease.path())
            .field("types", &self.module.type_names())
            .finish()
    }
}

impl ModuleBoundary {
    /// Pair a module with the lease that keeps it resident
    pub fn new(module: PluginModule, lease: ModuleLease) -> Self {
        Self { module, lease }
    }

    /// Module path
    pub fn path(&self) -> &Path {
        self.lease.path()
    }

    /// Names of all exported plugin types
    pub fn type_names(&self) -> Vec<&str> {
        self.module.type_names()
    }

    /// Choose the factory to instantiate
    ///
    /// One type is taken as is. With several, `strict` rejects the module;
    /// otherwise the lexicographically smallest type name wins.
    pub fn select(&self, strict: bool) -> Result<&dyn PluginFactory, SelectionError> {
        let mut factories: Vec<&dyn PluginFactory> = self.module.factories().collect();
        match factories.len() {
            0 => Err(SelectionError::Empty),
            1 => Ok(factories.remove(0)),
            _ if strict => {
                let mut names: Vec<String> =
                    factories.iter().map(|f| f.type_name().to_string()).collect();
                names.sort();
                Err(SelectionError::Ambiguous(names))
            }
            _ => {
                factories.sort_by(|a, b| a.type_name().cmp(b.type_name()));
                Ok(factories.remove(0))
            }
        }
    }

    /// A new lease on this module
    pub fn lease(&self) -> ModuleLease {
        self.lease.clone()
    }

    /// Drop the factories, keeping only the lease
    pub fn into_lease(self) -> ModuleLease {
        let Self { module, lease } = self;
        drop(module);
        lease
    }
}

/// Run a factory, turning a constructor failure or panic into an error message
pub fn instantiate(factory: &dyn PluginFactory) -> Result<Box<dyn Plugin>, String> {
    match catch_unwind(AssertUnwindSafe(|| factory.create())) {
        Ok(Ok(instance)) => Ok(instance),
        Ok(Err(e)) => Err(format!("constructor of {} failed: {e}", factory.type_name())),
        Err(payload) => Err(format!(
            "constructor of {} panicked: {}",
            factory.type_name(),
            panic_message(payload.as_ref())
        )),
    }
}

/// Opens modules
#[async_trait]
pub trait ModuleResolver: Send + Sync + fmt::Debug {
    /// Open the module at `path` in a fresh boundary
    async fn open(&self, path: &Path) -> Result<ModuleBoundary, ModuleError>;
}

/// Resolver for shared libraries built with `declare_plexus_plugin!`
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLibraryResolver;

impl DynamicLibraryResolver {
    /// Create a new resolver
    pub fn new() -> Self {
        Self
    }

    #[allow(unsafe_code)]
    fn open_blocking(path: &Path) -> Result<ModuleBoundary, ModuleError> {
        // SAFETY: loading runs the library's initializers. Plugin directories
        // are trusted input.
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| ModuleError::invalid(path, format!("failed to load library: {e}")))?;

        let found = {
            // SAFETY: the symbol type matches the one `declare_plexus_plugin!`
            // emits.
            let api_version = unsafe { library.get::<extern "C" fn() -> u32>(API_VERSION_SYMBOL) }
                .map_err(|e| ModuleError::invalid(path, format!("missing API version: {e}")))?;
            api_version()
        };
        if found != PLUGIN_API_VERSION {
            return Err(ModuleError::ApiMismatch {
                path: path.to_path_buf(),
                found,
                expected: PLUGIN_API_VERSION,
            });
        }

        let entry: PluginEntryFn = {
            // SAFETY: API revisions match, so the entry point has the
            // `PluginEntryFn` signature.
            let symbol = unsafe { library.get::<PluginEntryFn>(ENTRY_SYMBOL) }
                .map_err(|e| ModuleError::invalid(path, format!("missing entry point: {e}")))?;
            *symbol
        };

        let module = catch_unwind(entry).map_err(|payload| {
            ModuleError::invalid(
                path,
                format!("entry point panicked: {}", panic_message(payload.as_ref())),
            )
        })?;

        debug!(
            path = %path.display(),
            types = module.len(),
            "Opened dynamic module"
        );

        let library: Arc<dyn Any + Send + Sync> = Arc::new(library);
        Ok(ModuleBoundary::new(module, ModuleLease::new(path, library)))
    }
}

#[async_trait]
impl ModuleResolver for DynamicLibraryResolver {
    async fn open(&self, path: &Path) -> Result<ModuleBoundary, ModuleError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ModuleError::NotFound(path.to_path_buf()));
        }
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(&owned))
            .await
            .map_err(|e| ModuleError::invalid(path, format!("loader task failed: {e}")))?
    }
}

type ModuleCtor = Arc<dyn Fn() -> PluginModule + Send + Sync>;

struct ResidentGuard {
    resident: Arc<AtomicUsize>,
}

impl Drop for ResidentGuard {
    fn drop(&mut self) {
        self.resident.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolver for modules linked into the host binary
///
/// Modules are registered against a path. Opening a path that is not
/// registered fails like opening a file that is not a plugin library.
/// The catalog counts open boundaries, so callers can check that nothing
/// stays resident after inspection or an unload.
#[derive(Default)]
pub struct StaticModuleCatalog {
    modules: RwLock<HashMap<PathBuf, ModuleCtor>>,
    resident: Arc<AtomicUsize>,
    opened: AtomicUsize,
}

impl fmt::Debug for StaticModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticModuleCatalog")
            .field("modules", &self.modules.read().keys().collect::<Vec<_>>())
            .field("resident", &self.resident_count())
            .finish()
    }
}

impl StaticModuleCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module constructor under `path`
    pub fn register<F>(&self, path: impl Into<PathBuf>, ctor: F)
    where
        F: Fn() -> PluginModule + Send + Sync + 'static,
    {
        self.modules.write().insert(path.into(), Arc::new(ctor));
    }

    /// Register a module whose entry point has the dynamic signature
    pub fn register_entry(&self, path: impl Into<PathBuf>, entry: PluginEntryFn) {
        self.register(path, entry);
    }

    /// Remove a registration
    pub fn unregister(&self, path: &Path) -> bool {
        self.modules.write().remove(path).is_some()
    }

    /// Whether a module is registered under `path`
    pub fn contains(&self, path: &Path) -> bool {
        self.modules.read().contains_key(path)
    }

    /// Boundaries currently alive
    pub fn resident_count(&self) -> usize {
        self.resident.load(Ordering::SeqCst)
    }

    /// Boundaries opened since creation
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModuleResolver for StaticModuleCatalog {
    async fn open(&self, path: &Path) -> Result<ModuleBoundary, ModuleError> {
        let ctor = self
            .modules
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| ModuleError::invalid(path, "not a plugin module"))?;

        let module = catch_unwind(AssertUnwindSafe(|| ctor())).map_err(|payload| {
            ModuleError::invalid(
                path,
                format!("entry point panicked: {}", panic_message(payload.as_ref())),
            )
        })?;

        self.opened.fetch_add(1, Ordering::SeqCst);
        self.resident.fetch_add(1, Ordering::SeqCst);
        trace!(path = %path.display(), "Opened static module");

        let guard: Arc<dyn Any + Send + Sync> = Arc::new(ResidentGuard {
            resident: Arc::clone(&self.resident),
        });
        Ok(ModuleBoundary::new(module, ModuleLease::new(path, guard)))
    }
}
