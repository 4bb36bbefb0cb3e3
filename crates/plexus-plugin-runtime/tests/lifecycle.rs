//! End-to-end lifecycle through registry, loader and event bus

use plexus_plugin_api::testing::{mock_module, MockPlugin};
use plexus_plugin_runtime::prelude::*;
use plexus_plugin_runtime::HandlerError;
use plexus_store::{InMemoryRepository, MetadataRepository, PluginRecord};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, PartialEq)]
struct PluginActivated {
    id: String,
}

#[tokio::test]
async fn test_register_enable_load_unload() {
    let dir = tempfile::tempdir().unwrap();
    let module_path = dir.path().join("p1.mod");
    std::fs::write(&module_path, b"").unwrap();

    let catalog = Arc::new(StaticModuleCatalog::new());
    catalog.register(module_path.clone(), || mock_module(MockPlugin::new("p1")));

    let repository = Arc::new(InMemoryRepository::new());
    repository
        .upsert(PluginRecord::new("p1", "P1", "1.0.0", &module_path))
        .await
        .unwrap();

    let registry = PluginRegistry::new(repository);
    let loader = PluginLoader::new(
        catalog.clone(),
        Arc::new(ServiceRegistry::new()),
        &PluginOptions::default(),
    );
    let cancel = CancellationToken::new();

    let record = registry.get_by_id("p1").await.unwrap().unwrap();
    assert!(!record.enabled);

    assert!(registry.set_enabled("p1", true).await.unwrap());
    let enabled = registry.list_enabled().await.unwrap();
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].id, "p1");

    let handle = loader.load(&enabled[0], &cancel).await.unwrap();
    assert_eq!(handle.id(), "p1");
    assert_eq!(loader.active_ids(), vec!["p1"]);
    drop(handle);

    assert!(loader.unload("p1", &cancel).await);
    assert_eq!(loader.active_count(), 0);
    assert!(!loader.unload("p1", &cancel).await);
    assert_eq!(catalog.resident_count(), 0);
}

#[tokio::test]
async fn test_plugins_resolve_event_bus_from_services() {
    let bus = EventBus::new();
    let services = ServiceRegistry::new();
    services.insert(Arc::new(bus.clone()));

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let resolved = services.get::<EventBus>().unwrap();
    let subscription = resolved.subscribe(move |event: Arc<PluginActivated>, _cancel| {
        let counter = Arc::clone(&counter);
        async move {
            assert_eq!(event.id, "p1");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        }
    });

    let report = bus.publish(PluginActivated { id: "p1".into() }).await;
    assert_eq!(report.invoked, 1);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    assert!(subscription.dispose());
    bus.publish(PluginActivated { id: "p1".into() }).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}
