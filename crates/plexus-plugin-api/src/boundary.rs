//! Host runtime boundary
//!
//! A plugin built as a shared library links its own copies of tokio, tracing
//! and the standard library. Those copies cannot see the host's runtime
//! context or subscriber, and a panic raised by them cannot unwind into host
//! frames.
//!
//! [`HostEnv`] carries the host's runtime handle and tracing dispatcher into
//! plugin code. [`Isolated`] runs every call into a plugin inside that
//! environment and catches panics on the plugin side of the boundary.
//! [`declare_plexus_plugin!`](crate::declare_plexus_plugin) wraps exported
//! plugin types in [`Isolated`].

use crate::background::{BackgroundTask, BackgroundWork};
use crate::context::PluginContext;
use crate::error::{PluginError, Result};
use crate::installer::PluginInstaller;
use crate::module::PluginModule;
use crate::plugin::{Plugin, ServiceContribution};
use crate::services::ServiceRegistry;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, Dispatch};

/// The host's tokio runtime and tracing dispatcher
#[derive(Debug, Clone)]
pub struct HostEnv {
    handle: Handle,
    dispatch: Dispatch,
}

impl HostEnv {
    /// Pair a runtime handle with a dispatcher
    pub fn new(handle: Handle, dispatch: Dispatch) -> Self {
        Self { handle, dispatch }
    }

    /// Capture the runtime and dispatcher of the calling thread
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn current() -> Option<Self> {
        let handle = Handle::try_current().ok()?;
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);
        Some(Self { handle, dispatch })
    }

    /// Runtime handle
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `f` with the host runtime and dispatcher installed
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let _runtime = self.handle.enter();
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Spawn `future` on the host runtime
    ///
    /// Every poll runs inside this environment. A panic resolves the task to
    /// [`PluginError::Panicked`].
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.handle.spawn(Contained::new(Some(self.clone()), future))
    }
}

fn within<R>(env: Option<&HostEnv>, f: impl FnOnce() -> R) -> R {
    match env {
        Some(env) => env.enter(f),
        None => f(),
    }
}

/// Run plugin code inside `env`, turning a panic into an error
pub fn contain<R>(env: Option<&HostEnv>, f: impl FnOnce() -> R) -> Result<R> {
    catch_unwind(AssertUnwindSafe(|| within(env, f)))
        .map_err(|payload| PluginError::panicked(panic_message(payload.as_ref())))
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Future polled through [`contain`]
///
/// The inner future is also dropped inside the environment.
pub struct Contained<F> {
    env: Option<HostEnv>,
    future: Option<Pin<Box<F>>>,
}

impl<F> fmt::Debug for Contained<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contained")
            .field("env", &self.env.is_some())
            .field("finished", &self.future.is_none())
            .finish()
    }
}

impl<F> Contained<F> {
    /// Wrap `future`
    pub fn new(env: Option<HostEnv>, future: F) -> Self {
        Self {
            env,
            future: Some(Box::pin(future)),
        }
    }

    fn release(&mut self) {
        if let Some(future) = self.future.take() {
            let _ = contain(self.env.as_ref(), move || drop(future));
        }
    }
}

impl<F, T> Future for Contained<F>
where
    F: Future<Output = Result<T>>,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(future) = this.future.as_mut() else {
            return Poll::Ready(Err(PluginError::invalid_state(
                "future polled after completion",
            )));
        };

        let polled = contain(this.env.as_ref(), || future.as_mut().poll(cx));
        let output = match polled {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(output)) => output,
            Err(panicked) => Err(panicked),
        };
        this.release();
        Poll::Ready(output)
    }
}

impl<F> Drop for Contained<F> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Plugin adapter that runs every call into `P` through [`contain`]
///
/// The environment is taken from the [`PluginContext`] at initialization.
#[derive(Debug)]
pub struct Isolated<P> {
    inner: P,
    env: Option<HostEnv>,
}

impl<P: Plugin> Isolated<P> {
    /// Wrap a plugin
    pub fn new(inner: P) -> Self {
        Self { inner, env: None }
    }

    /// The wrapped plugin
    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: Plugin + 'static> Plugin for Isolated<P> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn version(&self) -> &str {
        self.inner.version()
    }

    async fn initialize(&mut self, ctx: PluginContext) -> Result<()> {
        self.env = ctx.host_env().cloned();
        let env = self.env.clone();
        Contained::new(env, self.inner.initialize(ctx)).await
    }

    async fn shutdown(&mut self, cancel: CancellationToken) -> Result<()> {
        let env = self.env.clone();
        Contained::new(env, self.inner.shutdown(cancel)).await
    }

    fn as_service_contribution(&self) -> Option<&dyn ServiceContribution> {
        match self.inner.as_service_contribution() {
            Some(_) => Some(self),
            None => None,
        }
    }

    fn as_background_work(&self) -> Option<&dyn BackgroundWork> {
        match self.inner.as_background_work() {
            Some(_) => Some(self),
            None => None,
        }
    }

    fn as_installer(&self) -> Option<&dyn PluginInstaller> {
        match self.inner.as_installer() {
            Some(_) => Some(self),
            None => None,
        }
    }
}

#[async_trait]
impl<P: Plugin + 'static> PluginInstaller for Isolated<P> {
    async fn is_installed(&self, cancel: CancellationToken) -> Result<bool> {
        match self.inner.as_installer() {
            Some(installer) => {
                Contained::new(self.env.clone(), installer.is_installed(cancel)).await
            }
            None => Ok(true),
        }
    }

    async fn install(&self, cancel: CancellationToken) -> Result<bool> {
        match self.inner.as_installer() {
            Some(installer) => Contained::new(self.env.clone(), installer.install(cancel)).await,
            None => Ok(true),
        }
    }

    async fn uninstall(&self, cancel: CancellationToken) -> Result<bool> {
        match self.inner.as_installer() {
            Some(installer) => {
                Contained::new(self.env.clone(), installer.uninstall(cancel)).await
            }
            None => Ok(false),
        }
    }
}

impl<P: Plugin> ServiceContribution for Isolated<P> {
    fn configure_services(&self, services: &ServiceRegistry) -> Result<()> {
        contain(self.env.as_ref(), || match self.inner.as_service_contribution() {
            Some(contribution) => contribution.configure_services(services),
            None => Ok(()),
        })?
    }

    fn configure_pipeline(&self, pipeline: &mut dyn Any) -> Result<()> {
        contain(self.env.as_ref(), || match self.inner.as_service_contribution() {
            Some(contribution) => contribution.configure_pipeline(pipeline),
            None => Ok(()),
        })?
    }
}

impl<P: Plugin> BackgroundWork for Isolated<P> {
    fn background_tasks(&self) -> Vec<Box<dyn BackgroundTask>> {
        let listed = contain(self.env.as_ref(), || {
            self.inner
                .as_background_work()
                .map(|work| work.background_tasks())
                .unwrap_or_default()
        });

        match listed {
            Ok(tasks) => tasks
                .into_iter()
                .map(|inner| {
                    Box::new(IsolatedTask {
                        inner,
                        env: self.env.clone(),
                    }) as Box<dyn BackgroundTask>
                })
                .collect(),
            Err(e) => {
                within(self.env.as_ref(), || {
                    error!(plugin = %self.inner.id(), error = %e, "Listing background tasks failed");
                });
                Vec::new()
            }
        }
    }
}

#[derive(Debug)]
struct IsolatedTask {
    inner: Box<dyn BackgroundTask>,
    env: Option<HostEnv>,
}

#[async_trait]
impl BackgroundTask for IsolatedTask {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        let env = self.env.clone();
        Contained::new(env, self.inner.start(cancel)).await
    }

    async fn stop(&mut self, cancel: CancellationToken) -> Result<()> {
        let env = self.env.clone();
        Contained::new(env, self.inner.stop(cancel)).await
    }
}

/// Build a module inside the exporting library
///
/// A panic while registering yields an empty module, which the host reports
/// as exporting no plugin type.
pub fn export(build: impl FnOnce(&mut PluginModule)) -> PluginModule {
    let mut module = PluginModule::new();
    match contain(None, || build(&mut module)) {
        Ok(()) => module,
        Err(_) => PluginModule::new(),
    }
}
