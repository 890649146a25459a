//! End-to-end pairing tests
//!
//! Devices and apps meet on an in-process rendezvous, run the real pairing
//! flows, and then replicate through their background replication tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use masq_core::crypto::{os_crypto, KdfParams, SharedKey};
use masq_core::pairing::{AppClient, ChannelConsent, ConsentPrompt, PairingLink, PairingOptions};
use masq_core::store::MemoryBackend;
use masq_core::{
    AppRequest, Device, Masq, MasqConfig, MasqError, MemoryHub, NewProfile, PairingOutcome,
    ProtocolError, PublicProfile, StaticConsent, StoreKey,
};
use serde_json::json;

// ============================================================================
// Helpers
// ============================================================================

fn config() -> MasqConfig {
    let mut config = MasqConfig::default();
    config.kdf = KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };
    config.pairing.round_trip_timeout_secs = 5;
    config.pairing.connect_timeout_secs = 5;
    config
}

fn device_with(hub: &MemoryHub, node: &str, config: MasqConfig, consent: Arc<dyn ConsentPrompt>) -> Arc<Masq> {
    Arc::new(Masq::new(
        config,
        MemoryBackend::shared(),
        Arc::new(hub.node(node)),
        consent,
        os_crypto(),
    ))
}

/// A device with one profile, opened
async fn device(hub: &MemoryHub, node: &str, consent: Arc<dyn ConsentPrompt>) -> (Arc<Masq>, PublicProfile) {
    let masq = device_with(hub, node, config(), consent);
    let profile = masq
        .add_profile(NewProfile {
            username: "jdoe".into(),
            firstname: "Jane".into(),
            passphrase: "s3cret-pass".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    masq.open_profile(&profile.id, "s3cret-pass").await.unwrap();
    (masq, profile)
}

fn app(hub: &MemoryHub, node: &str) -> AppClient {
    AppClient::new(
        AppRequest {
            name: "Notes".into(),
            description: "Take notes".into(),
            image: "https://example.com/notes.png".into(),
        },
        MemoryBackend::shared(),
        Arc::new(hub.node(node)),
        PairingOptions {
            consent_timeout: Duration::from_secs(5),
            round_trip_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        },
        os_crypto(),
    )
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Flow A: app login
// ============================================================================

#[tokio::test]
async fn test_app_login_granted() {
    let hub = MemoryHub::new();
    let (device, profile) = device(&hub, "device", Arc::new(StaticConsent(true))).await;
    let client = app(&hub, "app");
    let link = device.new_link();

    let device_task = {
        let device = device.clone();
        let link = link.clone();
        tokio::spawn(async move { device.handle_user_app_login(&link).await })
    };
    let app_outcome = client.login(&link).await.unwrap();
    let device_outcome = device_task.await.unwrap().unwrap();

    let db_id = format!("{}-Notes", profile.id);
    let granted = PairingOutcome::Granted {
        db_id: db_id.clone(),
    };
    assert_eq!(app_outcome, granted);
    assert_eq!(device_outcome, granted);

    // The app is registered with its store key
    let apps = device.get_apps().await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].name, "Notes");
    assert_eq!(apps[0].description, "Take notes");
    let device_store = device.stores().get(&db_id).unwrap();
    let key = device_store.key().await.unwrap();
    assert_eq!(apps[0].store_key, Some(key.to_hex()));

    // The store accepts writes signed by the app, and they reach the device
    let app_store = client.store(&db_id).unwrap();
    assert!(app_store.is_writable().await.unwrap());
    assert!(device_store
        .is_authorized(&app_store.local_key().await.unwrap())
        .await
        .unwrap());
    app_store.put("/notes/1", &json!({"text": "hello"})).await.unwrap();
    eventually(|| {
        let store = device_store.clone();
        async move { store.get("/notes/1").await.unwrap().is_some() }
    })
    .await;

    client.shutdown().await;
    device.shutdown().await;
}

#[tokio::test]
async fn test_app_login_refused() {
    let hub = MemoryHub::new();
    let (device, profile) = device(&hub, "device", Arc::new(StaticConsent(false))).await;
    let client = app(&hub, "app");
    let link = device.new_link();

    let device_task = {
        let device = device.clone();
        let link = link.clone();
        tokio::spawn(async move { device.handle_user_app_login(&link).await })
    };
    assert_eq!(client.login(&link).await.unwrap(), PairingOutcome::Refused);
    assert_eq!(
        device_task.await.unwrap().unwrap(),
        PairingOutcome::Refused
    );

    // Nothing was provisioned or registered
    assert!(device.get_apps().await.unwrap().is_empty());
    assert!(device
        .stores()
        .get(&format!("{}-Notes", profile.id))
        .is_none());
    assert!(client.store(&format!("{}-Notes", profile.id)).is_none());

    device.shutdown().await;
}

#[tokio::test]
async fn test_consent_timeout_abandons() {
    let hub = MemoryHub::new();
    let (prompt, _ui) = ChannelConsent::new(1);
    let mut cfg = config();
    cfg.pairing.consent_timeout_secs = 1;
    let device = device_with(&hub, "device", cfg, Arc::new(prompt));
    let profile = device
        .add_profile(NewProfile {
            username: "jdoe".into(),
            passphrase: "s3cret-pass".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    device.open_profile(&profile.id, "s3cret-pass").await.unwrap();

    let client = app(&hub, "app");
    let link = device.new_link();
    let device_task = {
        let device = device.clone();
        let link = link.clone();
        tokio::spawn(async move { device.handle_user_app_login(&link).await })
    };

    // The UI never answers
    assert_eq!(client.login(&link).await.unwrap(), PairingOutcome::Refused);
    assert_eq!(
        device_task.await.unwrap().unwrap(),
        PairingOutcome::Abandoned
    );
    assert!(device.get_apps().await.unwrap().is_empty());

    device.shutdown().await;
}

#[tokio::test]
async fn test_wrong_key_grants_nothing() {
    let hub = MemoryHub::new();
    let (device, _) = device(&hub, "device", Arc::new(StaticConsent(true))).await;
    let client = app(&hub, "app");
    let link = device.new_link();

    // Same channel, different key
    let forged = PairingLink::new(
        link.channel.clone(),
        &SharedKey::from_bytes([0x42; 32]),
        vec![],
    );

    let device_task = {
        let device = device.clone();
        let link = link.clone();
        tokio::spawn(async move { device.handle_user_app_login(&link).await })
    };
    let app_err = client.login(&forged).await.unwrap_err();
    assert!(matches!(
        app_err,
        MasqError::Protocol(ProtocolError::Authentication)
    ));

    let device_err = device_task.await.unwrap().unwrap_err();
    assert!(device_err.is_protocol());
    assert!(device.get_apps().await.unwrap().is_empty());

    device.shutdown().await;
}

#[tokio::test]
async fn test_second_login_reuses_app_store() {
    let hub = MemoryHub::new();
    let (device, _) = device(&hub, "device", Arc::new(StaticConsent(true))).await;

    let mut keys = Vec::new();
    for node in ["app-1", "app-2"] {
        let client = app(&hub, node);
        let link = device.new_link();
        let device_task = {
            let device = device.clone();
            let link = link.clone();
            tokio::spawn(async move { device.handle_user_app_login(&link).await })
        };
        client.login(&link).await.unwrap();
        device_task.await.unwrap().unwrap();
        keys.push(device.get_apps().await.unwrap()[0].store_key.clone());
        client.shutdown().await;
    }

    let apps = device.get_apps().await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(keys[0], keys[1]);

    device.shutdown().await;
}

// ============================================================================
// Flow B: device sync
// ============================================================================

async fn sync_devices(owner_initiator: bool, joiner_initiator: bool) {
    let hub = MemoryHub::new();
    let (owner, profile) = device(&hub, "laptop", Arc::new(StaticConsent(true))).await;
    let joiner = device_with(&hub, "phone", config(), Arc::new(StaticConsent(true)));
    let link = owner.new_link();

    let owner_task = {
        let owner = owner.clone();
        let link = link.clone();
        tokio::spawn(async move { owner.sync_profile(&link, owner_initiator).await })
    };
    let joined = joiner.join_profile(&link, joiner_initiator).await.unwrap();
    let granted = PairingOutcome::Granted {
        db_id: profile.id.clone(),
    };
    assert_eq!(joined, granted);
    assert_eq!(owner_task.await.unwrap().unwrap(), granted);

    // Same store key on both sides, and the joiner is an authorized writer
    let owner_store = owner.stores().get(&profile.id).unwrap();
    let joiner_store = joiner.stores().get(&profile.id).unwrap();
    assert_eq!(
        owner_store.key().await.unwrap(),
        joiner_store.key().await.unwrap()
    );
    let joiner_key = joiner_store.local_key().await.unwrap();
    assert!(owner_store.is_authorized(&joiner_key).await.unwrap());
    assert_eq!(owner_store.writers().await.unwrap().len(), 2);

    // The profile replicates, and the joiner can log in with the same passphrase
    eventually(|| {
        let joiner = joiner.clone();
        async move { !joiner.get_profiles().await.unwrap().is_empty() }
    })
    .await;
    joiner.open_profile(&profile.id, "s3cret-pass").await.unwrap();

    // Writes flow from the joiner back to the owner
    joiner
        .add_device(Device {
            name: "Phone".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    eventually(|| {
        let owner = owner.clone();
        async move { owner.get_devices().await.unwrap().len() == 1 }
    })
    .await;

    owner.shutdown().await;
    joiner.shutdown().await;
}

#[tokio::test]
async fn test_device_sync_owner_initiates() {
    sync_devices(true, false).await;
}

#[tokio::test]
async fn test_device_sync_joiner_initiates() {
    sync_devices(false, true).await;
}

#[tokio::test]
async fn test_device_sync_neither_initiates() {
    sync_devices(false, false).await;
}

#[tokio::test]
async fn test_join_with_wrong_key_fails() {
    let hub = MemoryHub::new();
    let (owner, profile) = device(&hub, "laptop", Arc::new(StaticConsent(true))).await;
    let joiner = device_with(&hub, "phone", config(), Arc::new(StaticConsent(true)));
    let link = owner.new_link();
    let forged = PairingLink::new(link.channel.clone(), &SharedKey::from_bytes([1; 32]), vec![]);

    let owner_task = {
        let owner = owner.clone();
        let link = link.clone();
        tokio::spawn(async move { owner.sync_profile(&link, true).await })
    };
    assert!(joiner.join_profile(&forged, false).await.is_err());
    assert!(owner_task.await.unwrap().is_err());

    let store = owner.stores().get(&profile.id).unwrap();
    assert_eq!(store.writers().await.unwrap().len(), 1);
    assert!(joiner.resources().index().profiles().unwrap().is_empty());

    owner.shutdown().await;
    joiner.shutdown().await;
}

// ============================================================================
// Flow C: provisioning
// ============================================================================

#[tokio::test]
async fn test_provision_new_app() {
    let hub = MemoryHub::new();
    let (device, profile) = device(&hub, "device", Arc::new(StaticConsent(false))).await;
    let client = app(&hub, "app");
    let link = device.new_link();

    let device_task = {
        let device = device.clone();
        let link = link.clone();
        tokio::spawn(async move { device.create_app(&link, "Notes").await })
    };
    let app_outcome = client.provision(&link, "notes").await.unwrap();
    assert_eq!(
        app_outcome,
        PairingOutcome::Granted {
            db_id: "notes".into()
        }
    );
    let db_id = format!("{}-Notes", profile.id);
    assert_eq!(
        device_task.await.unwrap().unwrap(),
        PairingOutcome::Granted {
            db_id: db_id.clone()
        }
    );

    // No consent was needed, the app is recorded, and both sides hold one store
    let apps = device.get_apps().await.unwrap();
    assert_eq!(apps.len(), 1);
    let app_store = client.store("notes").unwrap();
    let key: StoreKey = app_store.key().await.unwrap();
    assert_eq!(apps[0].store_key, Some(key.to_hex()));
    assert!(app_store.is_writable().await.unwrap());

    client.shutdown().await;
    device.shutdown().await;
}

#[tokio::test]
async fn test_provision_opens_app_store_before_app_connects() {
    let hub = MemoryHub::new();
    let (device, profile) = device(&hub, "device", Arc::new(StaticConsent(false))).await;
    let link = device.new_link();
    let db_id = format!("{}-Notes", profile.id);

    let device_task = {
        let device = device.clone();
        let link = link.clone();
        tokio::spawn(async move { device.create_app(&link, "Notes").await })
    };

    // No app is on the channel yet, but the store is already writable
    eventually(|| {
        let (device, db_id) = (device.clone(), db_id.clone());
        async move { device.stores().get(&db_id).is_some() }
    })
    .await;
    let store = device.stores().get(&db_id).unwrap();
    assert!(store.is_writable().await.unwrap());
    assert!(!device_task.is_finished());

    let client = app(&hub, "app");
    client.provision(&link, "notes").await.unwrap();
    device_task.await.unwrap().unwrap();
    let app_store = client.store("notes").unwrap();
    assert_eq!(app_store.key().await.unwrap(), store.key().await.unwrap());

    client.shutdown().await;
    device.shutdown().await;
}

#[tokio::test]
async fn test_provision_same_name_twice_keeps_one_record() {
    let hub = MemoryHub::new();
    let (device, _) = device(&hub, "device", Arc::new(StaticConsent(false))).await;

    for node in ["app-1", "app-2"] {
        let client = app(&hub, node);
        let link = device.new_link();
        let device_task = {
            let device = device.clone();
            let link = link.clone();
            tokio::spawn(async move { device.create_app(&link, "Notes").await })
        };
        client.provision(&link, "notes").await.unwrap();
        device_task.await.unwrap().unwrap();
        client.shutdown().await;
    }

    assert_eq!(device.get_apps().await.unwrap().len(), 1);
    device.shutdown().await;
}

#[tokio::test]
async fn test_provision_rejects_other_app() {
    let hub = MemoryHub::new();
    let (device, _) = device(&hub, "device", Arc::new(StaticConsent(false))).await;
    let client = app(&hub, "app");
    let link = device.new_link();

    // The device provisions "Mail" but the app calls itself "Notes"
    let device_task = {
        let device = device.clone();
        let link = link.clone();
        tokio::spawn(async move { device.create_app(&link, "Mail").await })
    };
    assert!(client.provision(&link, "notes").await.is_err());
    let err = device_task.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        MasqError::Protocol(ProtocolError::Malformed(_))
    ));
    assert!(device.get_apps().await.unwrap().is_empty());

    device.shutdown().await;
}
