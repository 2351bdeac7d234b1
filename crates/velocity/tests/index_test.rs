//! Bundle indexing and creation through the manager.
//! Run with: cargo test -p velocity --test index_test

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use velocity::test_utils::{FakeDisplay, FakeEngine};
use velocity::{Error, Manager, ManagerConfig, Registry, ScreenSize, VmProperties, VmState};

fn manager(bundle_dir: &Path) -> Manager {
    Manager::new(
        ManagerConfig::default().with_bundle_dir(bundle_dir),
        Registry::new(),
        Arc::new(FakeEngine::new()),
        FakeDisplay::new()
            .context()
            .expect("Failed to start display context"),
    )
    .expect("Failed to create manager")
}

fn write_bundle(root: &Path, dir: &str, definition: Option<&str>) {
    let bundle = root.join(dir);
    fs::create_dir_all(&bundle).expect("Failed to create bundle");
    if let Some(definition) = definition {
        fs::write(bundle.join("Velocity.json"), definition).expect("Failed to write definition");
    }
}

fn definition(name: &str) -> String {
    format!(r#"{{ "name": "{name}", "screen_size": {{ "width": 1024, "height": 768 }} }}"#)
}

async fn available_names(manager: &Manager) -> Vec<String> {
    manager
        .available()
        .await
        .into_iter()
        .map(|properties| properties.name)
        .collect()
}

#[tokio::test]
async fn test_index_skips_bundles_without_definition() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    write_bundle(dir.path(), "alpha", Some(&definition("alpha")));
    write_bundle(dir.path(), "beta", None);
    write_bundle(dir.path(), "gamma", Some(&definition("gamma")));
    let manager = manager(dir.path());

    let count = manager.index().await.expect("Indexing failed");

    assert_eq!(count, 2);
    assert_eq!(available_names(&manager).await, vec!["alpha", "gamma"]);
}

#[tokio::test]
async fn test_reindexing_is_idempotent() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    write_bundle(dir.path(), "alpha", Some(&definition("alpha")));
    write_bundle(dir.path(), "gamma", Some(&definition("gamma")));
    let manager = manager(dir.path());

    manager.index().await.expect("First index failed");
    let first = manager.available().await;
    manager.index().await.expect("Second index failed");

    assert_eq!(manager.available().await, first);
}

#[tokio::test]
async fn test_malformed_definition_leaves_catalog_untouched() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    write_bundle(dir.path(), "alpha", Some(&definition("alpha")));
    let manager = manager(dir.path());
    manager.index().await.expect("Indexing failed");

    write_bundle(dir.path(), "beta", Some(&definition("beta")));
    write_bundle(dir.path(), "broken", Some(r#"{ "name": "broken" "#));
    let result = manager.index().await;

    assert!(matches!(result, Err(Error::Index { .. })));
    assert_eq!(available_names(&manager).await, vec!["alpha"]);
}

#[tokio::test]
async fn test_duplicate_names_across_bundles_fail_indexing() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    write_bundle(dir.path(), "one", Some(&definition("alpha")));
    write_bundle(dir.path(), "two", Some(&definition("alpha")));
    let manager = manager(dir.path());

    let result = manager.index().await;

    assert!(matches!(result, Err(Error::DuplicateName(name)) if name == "alpha"));
    assert!(manager.available().await.is_empty());
}

#[tokio::test]
async fn test_created_vm_is_found_by_later_index() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let properties = VmProperties::new("alpha", ScreenSize::new(1280, 800)).with_resources(2, 2048);

    let vm = manager(dir.path())
        .create(properties.clone())
        .await
        .expect("Failed to create VM");
    assert_eq!(vm.vm_state, VmState::Stopped);

    let fresh = manager(dir.path());
    fresh.index().await.expect("Indexing failed");
    assert_eq!(fresh.available().await, vec![properties]);
}

#[tokio::test]
async fn test_create_rejects_duplicate_name() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let manager = manager(dir.path());
    manager
        .create(VmProperties::new("alpha", ScreenSize::new(800, 600)))
        .await
        .expect("Failed to create VM");

    let result = manager
        .create(VmProperties::new("alpha", ScreenSize::new(640, 480)))
        .await;

    assert!(matches!(result, Err(Error::DuplicateName(_))));
    let status = manager.status("alpha").await.expect("Unknown VM");
    assert_eq!(status.vm_info.screen_size, ScreenSize::new(800, 600));
}

#[tokio::test]
async fn test_failed_deploy_registers_nothing() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let manager = manager(dir.path());

    let result = manager
        .create(VmProperties::new("../escape", ScreenSize::new(800, 600)))
        .await;

    assert!(matches!(result, Err(Error::Deploy { .. })));
    assert!(manager.available().await.is_empty());
    assert!(!dir.path().join("../escape").exists());
}
