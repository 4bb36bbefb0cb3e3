//! Host lifecycle integration tests

use plexus_config::{Config, StorageConfig};
use plexus_host::{HostError, HostState, PluginHost};
use plexus_plugin_api::testing::{mock_module, Journal, MockPlugin, MockService, TaskSpec};
use plexus_plugin_runtime::{
    EventBus, PluginOptions, PluginRuntimeError, StaticModuleCatalog,
};
use plexus_store::{InMemoryRepository, MetadataRepository};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    dir: TempDir,
    catalog: Arc<StaticModuleCatalog>,
    repository: Arc<InMemoryRepository>,
    journal: Journal,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            catalog: Arc::new(StaticModuleCatalog::new()),
            repository: Arc::new(InMemoryRepository::new()),
            journal: Journal::new(),
        }
    }

    fn plugin_dir(&self) -> PathBuf {
        self.dir.path().join("plugins")
    }

    fn options(&self, auto_enable: bool) -> PluginOptions {
        let mut options = PluginOptions::with_directory(self.plugin_dir());
        options.extensions = vec!["mod".to_string()];
        options.auto_enable_new_plugins = auto_enable;
        options
    }

    /// Drop a module file for `plugin` into the plugin directory
    fn install(&self, plugin: MockPlugin) -> PathBuf {
        std::fs::create_dir_all(self.plugin_dir()).unwrap();
        let path = self.plugin_dir().join(format!("{}.mod", plugin_id(&plugin)));
        std::fs::write(&path, b"").unwrap();
        let plugin = plugin.with_journal(self.journal.clone());
        self.catalog
            .register(path.clone(), move || mock_module(plugin.clone()));
        path
    }

    fn host(&self, auto_enable: bool) -> PluginHost {
        PluginHost::builder()
            .options(self.options(auto_enable))
            .resolver(self.catalog.clone())
            .repository(self.repository.clone())
            .build()
            .unwrap()
    }

    fn lifecycle_entries(&self) -> Vec<String> {
        self.journal
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("stop:") || e.starts_with("shutdown:"))
            .collect()
    }
}

fn plugin_id(plugin: &MockPlugin) -> String {
    use plexus_plugin_api::Plugin;
    plugin.id().to_string()
}

#[tokio::test]
async fn test_register_enable_load_unload_scenario() {
    let fx = Fixture::new();
    fx.install(MockPlugin::new("p1"));
    let host = fx.host(false);

    let records = host.discover().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "p1");
    assert!(!records[0].enabled);
    assert!(host.registry().list_enabled().await.unwrap().is_empty());

    assert!(host.registry().set_enabled("p1", true).await.unwrap());
    let enabled = host.registry().list_enabled().await.unwrap();
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].id, "p1");

    let cancel = CancellationToken::new();
    let handle = host.loader().load(&enabled[0], &cancel).await.unwrap();
    assert_eq!(handle.id(), "p1");
    assert_eq!(host.loader().active_ids(), vec!["p1"]);
    drop(handle);

    assert!(host.loader().unload("p1", &cancel).await);
    assert_eq!(host.loader().active_count(), 0);
    assert!(!host.loader().unload("p1", &cancel).await);
    assert_eq!(fx.catalog.resident_count(), 0);
}

#[tokio::test]
async fn test_start_and_stop_in_lifecycle_order() {
    let fx = Fixture::new();
    fx.install(
        MockPlugin::new("a")
            .contributing_services()
            .with_task(TaskSpec::new("t")),
    );
    fx.install(MockPlugin::new("b"));
    fx.install(MockPlugin::new("c").failing_init());
    let host = fx.host(true);

    let report = host.start().await.unwrap();
    assert_eq!(host.state(), HostState::Running);
    assert_eq!(report.discovered, 3);
    assert_eq!(report.loaded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.services_configured, 1);
    assert_eq!(report.tasks_started, 1);

    let service = host.services().get::<MockService>().unwrap();
    assert_eq!(service.contributed_by, "a");
    assert!(host.services().get::<EventBus>().is_some());
    assert_eq!(host.loader().active_ids(), vec!["a", "b"]);

    host.stop().await.unwrap();
    assert_eq!(host.state(), HostState::Stopped);
    assert_eq!(host.loader().active_count(), 0);
    assert_eq!(host.supervisor().started_count().await, 0);
    assert_eq!(
        fx.lifecycle_entries(),
        vec!["stop:a/t", "shutdown:b", "shutdown:a"]
    );
    assert_eq!(fx.catalog.resident_count(), 0);
}

#[tokio::test]
async fn test_state_transitions() {
    let fx = Fixture::new();
    fx.install(MockPlugin::new("a"));
    let host = fx.host(true);

    assert_eq!(host.state(), HostState::Created);
    assert!(matches!(host.stop().await, Err(HostError::InvalidState(_))));

    host.start().await.unwrap();
    assert!(matches!(host.start().await, Err(HostError::InvalidState(_))));

    host.stop().await.unwrap();
    host.start().await.unwrap();
    assert!(host.loader().is_loaded("a"));
    host.stop().await.unwrap();
}

#[tokio::test]
async fn test_enable_and_disable_while_running() {
    let fx = Fixture::new();
    fx.install(MockPlugin::new("x").with_task(TaskSpec::new("t")));
    let host = fx.host(false);

    let report = host.start().await.unwrap();
    assert_eq!(report.loaded, 0);

    let handle = host.enable_plugin("x").await.unwrap().unwrap();
    assert_eq!(handle.id(), "x");
    assert!(host.loader().is_loaded("x"));
    assert_eq!(host.supervisor().started_count().await, 1);
    drop(handle);

    assert!(host.disable_plugin("x").await.unwrap());
    assert!(!host.loader().is_loaded("x"));
    assert_eq!(fx.lifecycle_entries(), vec!["stop:x/t", "shutdown:x"]);

    let record = host.registry().get_by_id("x").await.unwrap().unwrap();
    assert!(!record.enabled);

    // Already inactive: the flag still flips, nothing is unloaded.
    assert!(!host.disable_plugin("x").await.unwrap());

    host.stop().await.unwrap();
}

#[tokio::test]
async fn test_enable_unknown_plugin() {
    let fx = Fixture::new();
    let host = fx.host(false);

    let err = host.enable_plugin("ghost").await.unwrap_err();
    assert!(matches!(
        err,
        HostError::Runtime(PluginRuntimeError::PluginNotFound(_))
    ));
    assert!(host.disable_plugin("ghost").await.is_err());
}

#[tokio::test]
async fn test_enable_while_stopped_only_records() {
    let fx = Fixture::new();
    fx.install(MockPlugin::new("x"));
    let host = fx.host(false);
    host.discover().await.unwrap();

    assert!(host.enable_plugin("x").await.unwrap().is_none());
    assert!(!host.loader().is_loaded("x"));
    assert!(fx.repository.find_by_id("x").await.unwrap().unwrap().enabled);

    host.start().await.unwrap();
    assert!(host.loader().is_loaded("x"));
    host.stop().await.unwrap();
}

#[tokio::test]
async fn test_register_while_running_activates() {
    let fx = Fixture::new();
    let host = fx.host(true);
    host.start().await.unwrap();

    let path = fx.install(MockPlugin::new("late").contributing_services());
    let record = host.register_plugin(&path).await.unwrap();
    assert!(record.enabled);
    assert!(host.loader().is_loaded("late"));
    assert!(host.services().get::<MockService>().is_some());

    let missing = host.register_plugin(fx.plugin_dir().join("nope.mod")).await;
    assert!(missing.is_err());

    host.stop().await.unwrap();
}

#[tokio::test]
async fn test_run_until_shutdown() {
    let fx = Fixture::new();
    fx.install(MockPlugin::new("a").with_task(TaskSpec::new("t")));
    let host = fx.host(true);
    let signal = host.shutdown_signal();

    let runner = {
        let host = host.clone();
        tokio::spawn(async move { host.run_until_shutdown().await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while host.state() != HostState::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    signal.trigger();
    let report = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.loaded, 1);
    assert_eq!(host.state(), HostState::Stopped);
    assert_eq!(fx.lifecycle_entries(), vec!["stop:a/t", "shutdown:a"]);
}

#[tokio::test]
async fn test_start_after_shutdown_signal_is_cancelled() {
    let fx = Fixture::new();
    fx.install(MockPlugin::new("a"));
    let host = fx.host(true);

    host.shutdown_signal().trigger();
    let err = host.start().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(host.state(), HostState::Stopped);
    assert_eq!(host.loader().active_count(), 0);
}

#[tokio::test]
async fn test_restart_after_shutdown_signal() {
    let fx = Fixture::new();
    fx.install(MockPlugin::new("a"));
    let host = fx.host(true);

    host.start().await.unwrap();
    host.shutdown_signal().trigger();
    host.stop().await.unwrap();
    assert!(host.shutdown_signal().is_triggered());

    let report = host.start().await.unwrap();
    assert_eq!(report.loaded, 1);
    assert!(!host.shutdown_signal().is_triggered());
    assert_eq!(host.state(), HostState::Running);
    host.stop().await.unwrap();
    assert_eq!(fx.journal.count("init:a"), 2);
}

#[tokio::test]
async fn test_configure_pipeline_visits_contributors_in_load_order() {
    let fx = Fixture::new();
    fx.install(MockPlugin::new("a").contributing_services());
    fx.install(MockPlugin::new("b"));
    fx.install(MockPlugin::new("c").contributing_services());
    let host = fx.host(true);
    host.start().await.unwrap();

    let mut routes: Vec<String> = Vec::new();
    assert_eq!(host.configure_pipeline(&mut routes).await, 2);
    assert_eq!(routes, vec!["a", "c"]);

    // Unknown pipeline types are ignored by the plugins.
    let mut other = 0u32;
    assert_eq!(host.configure_pipeline(&mut other).await, 2);
    assert_eq!(other, 0);

    host.stop().await.unwrap();
}

#[tokio::test]
async fn test_json_storage_survives_restart() {
    let fx = Fixture::new();
    fx.install(MockPlugin::new("a"));

    let mut config = Config::default();
    config.plugins.directory = fx.plugin_dir();
    config.plugins.extensions = vec!["mod".to_string()];
    config.storage = StorageConfig::Json {
        path: fx.dir.path().join("plugins.json"),
    };

    let host = PluginHost::builder()
        .config(config.clone())
        .resolver(fx.catalog.clone())
        .build()
        .unwrap();
    host.discover().await.unwrap();
    host.enable_plugin("a").await.unwrap();

    let reopened = PluginHost::builder()
        .config(config)
        .resolver(fx.catalog.clone())
        .build()
        .unwrap();
    let report = reopened.start().await.unwrap();
    assert_eq!(report.loaded, 1);
    assert_eq!(reopened.registry().repository().backend_name(), "json");
    reopened.stop().await.unwrap();
}

#[tokio::test]
async fn test_installer_runs_once_across_restarts() {
    let fx = Fixture::new();
    let mock = MockPlugin::new("a").with_installer();
    fx.install(mock.clone());
    let host = fx.host(true);

    assert_eq!(host.start().await.unwrap().loaded, 1);
    assert!(mock.is_installed_now());
    host.stop().await.unwrap();

    assert_eq!(host.start().await.unwrap().loaded, 1);
    host.stop().await.unwrap();
    assert_eq!(fx.journal.count("install:a"), 1);
    assert_eq!(fx.journal.count("init:a"), 2);
}

#[tokio::test]
async fn test_failed_install_unloads_plugin() {
    let fx = Fixture::new();
    fx.install(MockPlugin::new("bad").failing_install().with_task(TaskSpec::new("t")));
    fx.install(MockPlugin::new("good"));
    let host = fx.host(true);

    let report = host.start().await.unwrap();
    assert_eq!(report.loaded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(host.loader().active_ids(), vec!["good"]);
    assert_eq!(fx.journal.count("shutdown:bad"), 1);
    assert!(fx.journal.matching("start:bad").is_empty());

    host.stop().await.unwrap();
}

#[tokio::test]
async fn test_uninstall_plugin() {
    let fx = Fixture::new();
    let mock = MockPlugin::new("a").with_installer().with_task(TaskSpec::new("t"));
    fx.install(mock.clone());
    let host = fx.host(true);
    host.start().await.unwrap();

    assert!(host.uninstall_plugin("a").await.unwrap());
    assert!(!mock.is_installed_now());
    assert!(!host.loader().is_loaded("a"));
    assert!(host.registry().list_enabled().await.unwrap().is_empty());
    assert_eq!(
        fx.journal.entries().iter().rev().take(3).cloned().collect::<Vec<_>>(),
        vec!["shutdown:a", "uninstall:a", "stop:a/t"]
    );

    // Inactive plugins are loaded for the uninstaller and unloaded again.
    assert!(!host.uninstall_plugin("a").await.unwrap());
    assert!(!host.loader().is_loaded("a"));
    assert_eq!(fx.journal.count("uninstall:a"), 2);
    let unknown = host.uninstall_plugin("ghost").await.unwrap_err();
    assert!(matches!(
        unknown,
        HostError::Runtime(PluginRuntimeError::PluginNotFound(_))
    ));

    host.stop().await.unwrap();
}
