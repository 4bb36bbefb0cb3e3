//! Loads the compiled shared library the way a deployed host does

use plexus_plugin_runtime::prelude::*;
use plexus_store::InMemoryRepository;
use sample_plugin::PLUGIN_ID;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// The cdylib cargo built next to this test binary
fn built_library() -> Option<PathBuf> {
    let name = libloading::library_filename("sample_plugin");
    let exe = std::env::current_exe().ok()?;
    let deps = exe.parent()?;
    [deps.to_path_buf(), deps.parent()?.to_path_buf()]
        .into_iter()
        .map(|dir| dir.join(&name))
        .find(|path| path.is_file())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_library_runs_on_host_runtime() {
    let Some(library) = built_library() else {
        eprintln!("sample_plugin shared library not built; skipping");
        return;
    };

    let dir = tempfile::tempdir().unwrap();
    let installed = dir.path().join(library.file_name().unwrap());
    std::fs::copy(&library, &installed).unwrap();

    let mut options = PluginOptions::with_directory(dir.path());
    options.auto_enable_new_plugins = true;
    options.shutdown_timeout = Duration::from_secs(5);

    let resolver: Arc<dyn ModuleResolver> = Arc::new(DynamicLibraryResolver::new());
    let discovery = PluginDiscovery::new(
        options.clone(),
        resolver.clone(),
        Arc::new(InMemoryRepository::new()),
    );
    let cancel = CancellationToken::new();

    let records = discovery.discover(&cancel).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, PLUGIN_ID);

    let loader = Arc::new(PluginLoader::new(
        resolver,
        Arc::new(ServiceRegistry::new()),
        &options,
    ));
    let handle = loader.load(&records[0], &cancel).await.unwrap();
    assert!(handle.capabilities().service_contribution);
    assert!(handle.capabilities().background_work);

    // Dropped while the library is still resident.
    {
        let services = ServiceRegistry::new();
        let contributed = handle
            .with_instance(|plugin| {
                plugin
                    .as_service_contribution()
                    .map(|contribution| contribution.configure_services(&services))
            })
            .await;
        assert!(matches!(contributed, Some(Ok(()))));
    }

    // The heartbeat spawns from inside the library; without the host
    // runtime handed across this would panic with no reactor running.
    let supervisor = BackgroundTaskSupervisor::new(Arc::clone(&loader));
    assert_eq!(supervisor.start(&cancel).await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(supervisor.stop(&cancel).await, 1);

    drop(handle);
    assert!(loader.unload(PLUGIN_ID, &cancel).await);
    assert_eq!(loader.active_count(), 0);
}
