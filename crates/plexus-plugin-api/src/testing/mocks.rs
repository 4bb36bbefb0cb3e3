//! Mock implementations for testing

use crate::background::{BackgroundTask, BackgroundWork};
use crate::context::PluginContext;
use crate::installer::PluginInstaller;
use crate::plugin::{Plugin, ServiceContribution};
use crate::services::ServiceRegistry;
use crate::PluginError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared, ordered log of lifecycle events
///
/// Entries look like `init:p1`, `shutdown:p1`, `start:p1/ticker`,
/// `stop:p1/ticker`, `configure:p1`, `install:p1` and `uninstall:p1`.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Entries starting with `prefix`, in order
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of entries equal to `entry`
    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().iter().filter(|e| *e == entry).count()
    }

    /// Drop all entries
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Service a [`MockPlugin`] registers when it contributes services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockService {
    /// Id of the contributing plugin
    pub contributed_by: String,
}

/// Behavior of one [`RecordingTask`]
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    /// Task name
    pub name: String,
    /// Fail `start`
    pub fail_start: bool,
    /// Fail `stop`
    pub fail_stop: bool,
}

impl TaskSpec {
    /// A task that starts and stops cleanly
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Make `start` fail
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Make `stop` fail
    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }
}

/// Background task that records its calls into a [`Journal`]
#[derive(Debug)]
pub struct RecordingTask {
    plugin_id: String,
    spec: TaskSpec,
    journal: Journal,
    running: bool,
}

impl RecordingTask {
    /// Create a task owned by `plugin_id`
    pub fn new(plugin_id: impl Into<String>, spec: TaskSpec, journal: Journal) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            spec,
            journal,
            running: false,
        }
    }

    /// Whether `start` succeeded and `stop` has not run since
    pub fn is_running(&self) -> bool {
        self.running
    }

    fn label(&self) -> String {
        format!("{}/{}", self.plugin_id, self.spec.name)
    }
}

#[async_trait]
impl BackgroundTask for RecordingTask {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn start(&mut self, _cancel: CancellationToken) -> crate::error::Result<()> {
        self.journal.record(format!("start:{}", self.label()));
        if self.spec.fail_start {
            return Err(PluginError::task(format!("{} refused to start", self.label())));
        }
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self, _cancel: CancellationToken) -> crate::error::Result<()> {
        self.journal.record(format!("stop:{}", self.label()));
        self.running = false;
        if self.spec.fail_stop {
            return Err(PluginError::task(format!("{} refused to stop", self.label())));
        }
        Ok(())
    }
}

/// Configurable plugin for host tests
///
/// Clones share the journal, so a clone kept by the test observes the
/// instance the host created from a factory.
#[derive(Debug, Clone)]
pub struct MockPlugin {
    id: String,
    name: String,
    version: String,
    journal: Journal,
    fail_init: bool,
    fail_shutdown: bool,
    init_delay: Option<Duration>,
    contributes_services: bool,
    tasks: Option<Vec<TaskSpec>>,
    installs: bool,
    fail_install: bool,
    installed: Arc<AtomicBool>,
}

impl MockPlugin {
    /// Create a mock plugin with the given id
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: format!("Mock {id}"),
            id,
            version: "1.0.0".to_string(),
            journal: Journal::new(),
            fail_init: false,
            fail_shutdown: false,
            init_delay: None,
            contributes_services: false,
            tasks: None,
            installs: false,
            fail_install: false,
            installed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the version string
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Record into an existing journal
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Make `initialize` fail
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Make `shutdown` fail
    pub fn failing_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }

    /// Delay `initialize`, honoring cancellation
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    /// Advertise service contribution
    pub fn contributing_services(mut self) -> Self {
        self.contributes_services = true;
        self
    }

    /// Advertise background work with one more task
    pub fn with_task(mut self, spec: TaskSpec) -> Self {
        self.tasks.get_or_insert_with(Vec::new).push(spec);
        self
    }

    /// Advertise background work with no tasks
    pub fn with_background_work(mut self) -> Self {
        self.tasks.get_or_insert_with(Vec::new);
        self
    }

    /// Advertise an installer that starts out not installed
    pub fn with_installer(mut self) -> Self {
        self.installs = true;
        self
    }

    /// Advertise an installer whose `install` fails
    pub fn failing_install(mut self) -> Self {
        self.installs = true;
        self.fail_install = true;
        self
    }

    /// Installed state, shared across clones
    pub fn is_installed_now(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// The shared journal
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Number of `initialize` calls across all clones
    pub fn init_call_count(&self) -> usize {
        self.journal.count(&format!("init:{}", self.id))
    }

    /// Number of `shutdown` calls across all clones
    pub fn shutdown_call_count(&self) -> usize {
        self.journal.count(&format!("shutdown:{}", self.id))
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn initialize(&mut self, ctx: PluginContext) -> crate::error::Result<()> {
        self.journal.record(format!("init:{}", self.id));

        if let Some(delay) = self.init_delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation().cancelled() => return Err(PluginError::Cancelled),
            }
        }

        if self.fail_init {
            return Err(PluginError::init(format!("{} failed to initialize", self.id)));
        }
        Ok(())
    }

    async fn shutdown(&mut self, _cancel: CancellationToken) -> crate::error::Result<()> {
        self.journal.record(format!("shutdown:{}", self.id));
        if self.fail_shutdown {
            return Err(PluginError::shutdown(format!("{} failed to shut down", self.id)));
        }
        Ok(())
    }

    fn as_service_contribution(&self) -> Option<&dyn ServiceContribution> {
        self.contributes_services.then_some(self as &dyn ServiceContribution)
    }

    fn as_background_work(&self) -> Option<&dyn BackgroundWork> {
        self.tasks.as_ref().map(|_| self as &dyn BackgroundWork)
    }

    fn as_installer(&self) -> Option<&dyn PluginInstaller> {
        self.installs.then_some(self as &dyn PluginInstaller)
    }
}

#[async_trait]
impl PluginInstaller for MockPlugin {
    async fn is_installed(&self, _cancel: CancellationToken) -> crate::error::Result<bool> {
        Ok(self.is_installed_now())
    }

    async fn install(&self, cancel: CancellationToken) -> crate::error::Result<bool> {
        self.journal.record(format!("install:{}", self.id));
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        if self.fail_install {
            return Err(PluginError::init(format!("{} failed to install", self.id)));
        }
        self.installed.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn uninstall(&self, _cancel: CancellationToken) -> crate::error::Result<bool> {
        self.journal.record(format!("uninstall:{}", self.id));
        Ok(self.installed.swap(false, Ordering::SeqCst))
    }
}

impl ServiceContribution for MockPlugin {
    fn configure_services(&self, services: &ServiceRegistry) -> crate::error::Result<()> {
        self.journal.record(format!("configure:{}", self.id));
        services.insert(Arc::new(MockService {
            contributed_by: self.id.clone(),
        }));
        Ok(())
    }

    /// Appends the plugin id when the pipeline is a `Vec<String>`
    fn configure_pipeline(&self, pipeline: &mut dyn std::any::Any) -> crate::error::Result<()> {
        self.journal.record(format!("pipeline:{}", self.id));
        if let Some(routes) = pipeline.downcast_mut::<Vec<String>>() {
            routes.push(self.id.clone());
        }
        Ok(())
    }
}

impl BackgroundWork for MockPlugin {
    fn background_tasks(&self) -> Vec<Box<dyn BackgroundTask>> {
        self.tasks
            .iter()
            .flatten()
            .map(|spec| {
                Box::new(RecordingTask::new(
                    self.id.clone(),
                    spec.clone(),
                    self.journal.clone(),
                )) as Box<dyn BackgroundTask>
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(id: &str) -> PluginContext {
        PluginContext::new(id, Arc::new(ServiceRegistry::new()), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_mock_plugin_records_lifecycle() {
        let mock = MockPlugin::new("p1");
        let mut instance = mock.clone();

        instance.initialize(context("p1")).await.unwrap();
        instance.shutdown(CancellationToken::new()).await.unwrap();

        assert_eq!(mock.init_call_count(), 1);
        assert_eq!(mock.shutdown_call_count(), 1);
        assert_eq!(mock.journal().entries(), vec!["init:p1", "shutdown:p1"]);
    }

    #[tokio::test]
    async fn test_mock_plugin_failures() {
        let mut mock = MockPlugin::new("bad").failing_init().failing_shutdown();
        assert!(mock.initialize(context("bad")).await.is_err());
        assert!(mock.shutdown(CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_init_delay_observes_cancellation() {
        let mut mock = MockPlugin::new("slow").with_init_delay(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = PluginContext::new("slow", Arc::new(ServiceRegistry::new()), cancel);

        let err = mock.initialize(ctx).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_capabilities_follow_configuration() {
        let bare = MockPlugin::new("bare");
        assert!(bare.as_background_work().is_none());
        assert!(bare.as_service_contribution().is_none());

        let worker = MockPlugin::new("worker")
            .with_task(TaskSpec::new("a"))
            .with_task(TaskSpec::new("b"))
            .contributing_services();
        assert!(worker.capabilities().background_work);
        assert!(worker.capabilities().service_contribution);
        assert_eq!(worker.background_tasks().len(), 2);
    }

    #[tokio::test]
    async fn test_recording_task() {
        let journal = Journal::new();
        let mut task = RecordingTask::new("p1", TaskSpec::new("tick"), journal.clone());

        task.start(CancellationToken::new()).await.unwrap();
        assert!(task.is_running());
        task.stop(CancellationToken::new()).await.unwrap();
        assert!(!task.is_running());

        assert_eq!(journal.matching("start:"), vec!["start:p1/tick"]);
        assert_eq!(journal.matching("stop:"), vec!["stop:p1/tick"]);
    }

    #[tokio::test]
    async fn test_installer_state_is_shared_across_clones() {
        let mock = MockPlugin::new("inst").with_installer();
        let instance = mock.clone();
        let installer = instance.as_installer().unwrap();
        let cancel = CancellationToken::new();

        assert!(!installer.is_installed(cancel.clone()).await.unwrap());
        assert!(installer.install(cancel.clone()).await.unwrap());
        assert!(mock.is_installed_now());
        assert!(installer.uninstall(cancel.clone()).await.unwrap());
        assert!(!installer.uninstall(cancel).await.unwrap());
        assert_eq!(
            mock.journal().entries(),
            vec!["install:inst", "uninstall:inst", "uninstall:inst"]
        );

        assert!(MockPlugin::new("none").as_installer().is_none());
    }

    #[tokio::test]
    async fn test_failing_install_leaves_state_untouched() {
        let mock = MockPlugin::new("bad").failing_install();
        let installer = mock.as_installer().unwrap();
        assert!(installer.install(CancellationToken::new()).await.is_err());
        assert!(!mock.is_installed_now());
    }

    #[test]
    fn test_configure_services() {
        let mock = MockPlugin::new("svc").contributing_services();
        let services = ServiceRegistry::new();
        mock.configure_services(&services).unwrap();

        let service = services.get::<MockService>().unwrap();
        assert_eq!(service.contributed_by, "svc");
    }
}
