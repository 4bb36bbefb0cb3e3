//! Plugin module export
//!
//! A plugin module is a unit the host can load: a shared library, or a set of
//! factories linked straight into the host binary. Either way the host sees a
//! [`PluginModule`], which lists one factory per concrete plugin type.
//!
//! Shared libraries expose two well-known symbols, both generated by
//! [`declare_plexus_plugin!`](crate::declare_plexus_plugin):
//!
//! - `plexus_plugin_api_version`: returns [`PLUGIN_API_VERSION`]
//! - `plexus_plugin_entrypoint`: returns the [`PluginModule`]

use crate::boundary::{contain, Isolated};
use crate::error::Result;
use crate::plugin::Plugin;
use std::fmt;
use std::marker::PhantomData;

/// API revision a module was compiled against
///
/// The host refuses modules reporting a different value.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Symbol name of the module constructor (NUL terminated)
pub const ENTRY_SYMBOL: &[u8] = b"plexus_plugin_entrypoint\0";

/// Symbol name of the API version query (NUL terminated)
pub const API_VERSION_SYMBOL: &[u8] = b"plexus_plugin_api_version\0";

/// Signature of the module constructor
pub type PluginEntryFn = fn() -> PluginModule;

/// Constructs instances of one concrete plugin type
pub trait PluginFactory: Send + Sync {
    /// Fully qualified name of the plugin type
    ///
    /// Used to pick a type deterministically when a module exports several.
    fn type_name(&self) -> &str;

    /// Create a fresh, uninitialized instance
    fn create(&self) -> Result<Box<dyn Plugin>>;
}

struct DefaultFactory<T>(PhantomData<fn() -> T>);

impl<T> PluginFactory for DefaultFactory<T>
where
    T: Plugin + Default + 'static,
{
    fn type_name(&self) -> &str {
        std::any::type_name::<T>()
    }

    fn create(&self) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(T::default()))
    }
}

struct IsolatedFactory<T>(PhantomData<fn() -> T>);

impl<T> PluginFactory for IsolatedFactory<T>
where
    T: Plugin + Default + 'static,
{
    fn type_name(&self) -> &str {
        std::any::type_name::<T>()
    }

    fn create(&self) -> Result<Box<dyn Plugin>> {
        let plugin = contain(None, T::default)?;
        Ok(Box::new(Isolated::new(plugin)))
    }
}

struct FnFactory<F> {
    type_name: String,
    ctor: F,
}

impl<F> PluginFactory for FnFactory<F>
where
    F: Fn() -> Box<dyn Plugin> + Send + Sync,
{
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn create(&self) -> Result<Box<dyn Plugin>> {
        Ok((self.ctor)())
    }
}

/// The set of plugin factories a module exports
#[derive(Default)]
pub struct PluginModule {
    factories: Vec<Box<dyn PluginFactory>>,
}

impl fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginModule")
            .field("types", &self.type_names())
            .finish()
    }
}

impl PluginModule {
    /// Create an empty module
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin type constructed through `Default`
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: Plugin + Default + 'static,
    {
        self.factories.push(Box::new(DefaultFactory::<T>(PhantomData)));
        self
    }

    /// Register a plugin type wrapped in [`Isolated`]
    ///
    /// Used by shared libraries, whose code must run inside the host
    /// environment and must not unwind into the host.
    pub fn register_isolated<T>(&mut self) -> &mut Self
    where
        T: Plugin + Default + 'static,
    {
        self.factories
            .push(Box::new(IsolatedFactory::<T>(PhantomData)));
        self
    }

    /// Register a plugin type built by a closure
    pub fn register_fn<F>(&mut self, type_name: impl Into<String>, ctor: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(FnFactory {
            type_name: type_name.into(),
            ctor,
        }));
        self
    }

    /// Register a custom factory
    pub fn register_factory(&mut self, factory: Box<dyn PluginFactory>) -> &mut Self {
        self.factories.push(factory);
        self
    }

    /// Iterate over the exported factories
    pub fn factories(&self) -> impl Iterator<Item = &dyn PluginFactory> {
        self.factories.iter().map(|factory| factory.as_ref())
    }

    /// Names of all exported plugin types, in registration order
    pub fn type_names(&self) -> Vec<&str> {
        self.factories.iter().map(|f| f.type_name()).collect()
    }

    /// Number of exported plugin types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether the module exports no plugin type
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Consume the module, yielding its factories
    pub fn into_factories(self) -> Vec<Box<dyn PluginFactory>> {
        self.factories
    }
}

/// Declare the entry points of a dynamic plugin module
///
/// Every listed type must implement [`Plugin`] and [`Default`]. Compile the
/// crate as a `cdylib` and drop the library into the host's plugin
/// directory. Exported types are wrapped in [`Isolated`], so their code runs
/// on the host runtime and their panics are caught inside the library.
///
/// # Example
///
/// ```ignore
/// plexus_plugin_api::declare_plexus_plugin!(MyPlugin);
/// ```
#[macro_export]
macro_rules! declare_plexus_plugin {
    ($($plugin:ty),+ $(,)?) => {
        #[no_mangle]
        pub extern "C" fn plexus_plugin_api_version() -> u32 {
            $crate::PLUGIN_API_VERSION
        }

        #[no_mangle]
        pub fn plexus_plugin_entrypoint() -> $crate::PluginModule {
            $crate::boundary::export(|module| {
                $(module.register_isolated::<$plugin>();)+
            })
        }
    };
}
