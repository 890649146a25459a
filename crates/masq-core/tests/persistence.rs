//! Persistence tests
//!
//! Everything a device knows has to survive a restart on the redb backend.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use masq_core::crypto::{os_crypto, KdfParams};
use masq_core::types::app_store_name;
use masq_core::{
    node_secret, open_backend, App, Device, Masq, MasqConfig, MasqError, MemoryHub, NewProfile,
    StaticConsent,
};
use serde_json::json;
use tempfile::TempDir;

fn config() -> MasqConfig {
    let mut config = MasqConfig::default();
    config.kdf = KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };
    config
}

async fn open(dir: &Path, hub: &MemoryHub) -> Masq {
    let masq = Masq::new(
        config(),
        open_backend(dir).unwrap(),
        Arc::new(hub.node("device")),
        Arc::new(StaticConsent(false)),
        os_crypto(),
    );
    masq.init().await.unwrap();
    masq
}

async fn close(masq: Masq) {
    masq.shutdown().await;
    drop(masq);
    // Let store tasks release their backend handles
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_profile_and_records_survive_restart() {
    let dir = TempDir::new().unwrap();
    let hub = MemoryHub::new();

    let (profile_id, app_store, key) = {
        let masq = open(dir.path(), &hub).await;
        let profile = masq
            .add_profile(NewProfile {
                username: "jdoe".into(),
                firstname: "Jane".into(),
                lastname: "Doe".into(),
                passphrase: "s3cret-pass".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        masq.open_profile(&profile.id, "s3cret-pass").await.unwrap();

        let name = app_store_name(&profile.id, "Notes");
        let store = masq.stores().open_ready(&name).await.unwrap();
        store.put("/notes/1", &json!({"text": "kept"})).await.unwrap();
        let key = store.key().await.unwrap();
        masq.add_app(App {
            name: "Notes".into(),
            store_key: Some(key.to_hex()),
            ..Default::default()
        })
        .await
        .unwrap();
        masq.add_device(Device {
            name: "Laptop".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        close(masq).await;
        (profile.id, name, key)
    };

    let masq = open(dir.path(), &hub).await;

    // The profile is listed without unlocking it, and the passphrase still works
    let profiles = masq.get_profiles().await.unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].id, profile_id);
    assert_eq!(profiles[0].lastname, "Doe");
    assert!(matches!(
        masq.open_profile(&profile_id, "wrong-pass-1!").await,
        Err(MasqError::InvalidPassphrase)
    ));
    masq.open_profile(&profile_id, "s3cret-pass").await.unwrap();

    let apps = masq.get_apps().await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].store_key, Some(key.to_hex()));
    assert_eq!(masq.get_devices().await.unwrap()[0].name, "Laptop");

    // The app store was reopened under the same identity, data intact
    let store = masq.stores().get(&app_store).unwrap();
    assert_eq!(store.key().await.unwrap(), key);
    assert!(store.is_writable().await.unwrap());
    assert_eq!(
        store.get("/notes/1").await.unwrap(),
        Some(json!({"text": "kept"}))
    );
    assert!(masq.replication().active().contains(&app_store));

    close(masq).await;
}

#[tokio::test]
async fn test_node_secret_is_stable() {
    let dir = TempDir::new().unwrap();
    let first = {
        let backend = open_backend(dir.path()).unwrap();
        node_secret(backend.as_ref(), os_crypto().as_ref()).unwrap()
    };
    let backend = open_backend(dir.path()).unwrap();
    let second = node_secret(backend.as_ref(), os_crypto().as_ref()).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_empty_data_dir_starts_clean() {
    let dir = TempDir::new().unwrap();
    let hub = MemoryHub::new();
    let masq = open(dir.path(), &hub).await;

    assert!(masq.get_profiles().await.unwrap().is_empty());
    assert!(matches!(
        masq.get_apps().await,
        Err(MasqError::NoOpenProfile)
    ));
    close(masq).await;
}
