//! Profiles, apps, and devices on top of replicated stores.
//!
//! Each profile lives in its own store, named by the profile id:
//!
//! ```text
//! /                     Profile document
//! /apps/index/{id}      true
//! /apps/{id}            App
//! /devices/index/{id}   true
//! /devices/{id}         Device
//! ```
//!
//! Adding an item writes its membership marker and its document in one
//! store batch, so neither can exist without the other. Every id has its own
//! marker path, so two devices adding items concurrently both keep theirs.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use ulid::Ulid;

use crate::crypto::{check_passphrase, derive_passphrase, KdfParams, SharedCrypto};
use crate::error::{MasqError, MasqResult};
use crate::store::{BatchOp, ReplicatedStore, SharedBackend, StoreRegistry};
use crate::types::{App, Device, NewProfile, Profile, PublicProfile, Resource};
use crate::validators::{is_name, is_password, is_username};

/// Backend key of the profile index
const PROFILES_KEY: &str = "local/profiles";

/// Profile document path
const PROFILE_PATH: &str = "/";

/// Persisted, ordered list of profile ids known on this device.
pub struct LocalIndex {
    backend: SharedBackend,
    lock: Mutex<()>,
}

impl LocalIndex {
    /// Index over a backend
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            lock: Mutex::new(()),
        }
    }

    /// Known profile ids, in creation order
    pub fn profiles(&self) -> MasqResult<Vec<String>> {
        match self.backend.get(PROFILES_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Whether `id` is known
    pub fn contains(&self, id: &str) -> MasqResult<bool> {
        Ok(self.profiles()?.iter().any(|p| p == id))
    }

    /// Append `id`; returns `false` if it was already present.
    pub fn add(&self, id: &str) -> MasqResult<bool> {
        let _guard = self.lock.lock();
        let mut ids = self.profiles()?;
        if ids.iter().any(|p| p == id) {
            return Ok(false);
        }
        ids.push(id.to_string());
        self.backend.put(PROFILES_KEY, &serde_json::to_vec(&ids)?)?;
        Ok(true)
    }
}

/// CRUD for profiles and their apps and devices
pub struct ResourceRegistry {
    stores: Arc<StoreRegistry>,
    index: LocalIndex,
    crypto: SharedCrypto,
    kdf: KdfParams,
    write_lock: tokio::sync::Mutex<()>,
    last_id: Mutex<Ulid>,
}

impl ResourceRegistry {
    /// Registry over the stores of one process
    pub fn new(stores: Arc<StoreRegistry>, kdf: KdfParams) -> Self {
        Self {
            index: LocalIndex::new(stores.backend().clone()),
            crypto: stores.crypto().clone(),
            stores,
            kdf,
            write_lock: tokio::sync::Mutex::new(()),
            last_id: Mutex::new(Ulid::nil()),
        }
    }

    /// The profile index
    pub fn index(&self) -> &LocalIndex {
        &self.index
    }

    /// Underlying stores
    pub fn stores(&self) -> &Arc<StoreRegistry> {
        &self.stores
    }

    /// Fresh ULID, strictly greater than any this registry handed out before
    fn new_id(&self) -> String {
        let mut random = [0u8; 16];
        self.crypto.fill_bytes(&mut random);
        let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let fresh = Ulid::from_parts(millis, u128::from_le_bytes(random));

        let mut last = self.last_id.lock();
        let next = if fresh > *last {
            fresh
        } else {
            last.increment().unwrap_or(fresh)
        };
        *last = next;
        next.to_string()
    }

    /// Store of a known profile
    pub async fn profile_store(&self, profile_id: &str) -> MasqResult<Arc<ReplicatedStore>> {
        if !self.index.contains(profile_id)? {
            return Err(MasqError::ProfileNotFound(profile_id.to_string()));
        }
        self.stores.open_ready(profile_id).await
    }

    /// Create a profile and its store.
    pub async fn add_profile(&self, new: NewProfile) -> MasqResult<PublicProfile> {
        validate_profile(&new.username, &new.firstname, &new.lastname)?;
        if !is_password(&new.passphrase) {
            return Err(MasqError::Validation(
                "Passphrase needs 8+ characters, a digit, and one of !?$#@()-*".to_string(),
            ));
        }

        let kdf = self.kdf;
        let crypto = self.crypto.clone();
        let passphrase = new.passphrase;
        let secret_hash = tokio::task::spawn_blocking(move || {
            derive_passphrase(&passphrase, kdf, crypto.as_ref())
        })
        .await
        .map_err(|e| MasqError::Crypto(format!("Passphrase task failed: {}", e)))??;

        let id = self.new_id();
        let profile = Profile {
            id: Some(id.clone()),
            username: new.username,
            firstname: new.firstname,
            lastname: new.lastname,
            image: new.image,
            secret_hash: Some(secret_hash),
        };

        let store = self.stores.open_ready(&id).await?;
        store.put(PROFILE_PATH, &profile).await?;
        self.index.add(&id)?;
        info!(profile = %id, username = %profile.username, "Profile created");

        profile
            .to_public()
            .ok_or_else(|| MasqError::Store("Profile lost its id".to_string()))
    }

    /// Public view of every local profile.
    ///
    /// Profiles joined from another device appear once their document has
    /// replicated.
    pub async fn get_profiles(&self) -> MasqResult<Vec<PublicProfile>> {
        let mut out = Vec::new();
        for id in self.index.profiles()? {
            let store = self.stores.open_ready(&id).await?;
            match store.get_as::<Profile>(PROFILE_PATH).await? {
                Some(profile) => out.extend(profile.to_public()),
                None => debug!(profile = %id, "Profile document not replicated yet"),
            }
        }
        Ok(out)
    }

    /// Full profile, including its verifier
    pub async fn get_profile(&self, profile_id: &str) -> MasqResult<Profile> {
        let store = self.profile_store(profile_id).await?;
        store
            .get_as::<Profile>(PROFILE_PATH)
            .await?
            .ok_or_else(|| MasqError::ProfileNotFound(profile_id.to_string()))
    }

    /// Load a profile if `passphrase` matches.
    pub async fn unlock_profile(&self, profile_id: &str, passphrase: &str) -> MasqResult<Profile> {
        let profile = self.get_profile(profile_id).await?;
        let stored = profile
            .secret_hash
            .clone()
            .ok_or(MasqError::InvalidPassphrase)?;
        let passphrase = passphrase.to_string();
        let ok = tokio::task::spawn_blocking(move || check_passphrase(&passphrase, &stored))
            .await
            .map_err(|e| MasqError::Crypto(format!("Passphrase task failed: {}", e)))??;
        if !ok {
            return Err(MasqError::InvalidPassphrase);
        }
        Ok(profile)
    }

    /// Replace a profile's fields. The verifier is kept unless one is given.
    pub async fn update_profile(&self, profile: Profile) -> MasqResult<PublicProfile> {
        let id = profile.id.clone().ok_or(MasqError::MissingId)?;
        validate_profile(&profile.username, &profile.firstname, &profile.lastname)?;

        let _guard = self.write_lock.lock().await;
        let existing = self.get_profile(&id).await?;
        let merged = Profile {
            secret_hash: profile.secret_hash.or(existing.secret_hash),
            ..profile
        };
        let store = self.stores.open_ready(&id).await?;
        store.put(PROFILE_PATH, &merged).await?;
        debug!(profile = %id, "Profile updated");

        merged
            .to_public()
            .ok_or_else(|| MasqError::Store("Profile lost its id".to_string()))
    }

    /// Register an app; its id is assigned here.
    pub async fn add_app(&self, profile_id: &str, app: App) -> MasqResult<App> {
        self.add(profile_id, app).await
    }

    /// Apps of a profile, in creation order
    pub async fn get_apps(&self, profile_id: &str) -> MasqResult<Vec<App>> {
        self.list(profile_id).await
    }

    /// Replace an app record; it must carry the id of an existing app.
    pub async fn update_app(&self, profile_id: &str, app: App) -> MasqResult<App> {
        self.update(profile_id, app).await
    }

    /// App with this name, if registered
    pub async fn find_app(&self, profile_id: &str, name: &str) -> MasqResult<Option<App>> {
        Ok(self
            .get_apps(profile_id)
            .await?
            .into_iter()
            .find(|app| app.name == name))
    }

    /// Register a device; its id is assigned here.
    pub async fn add_device(&self, profile_id: &str, device: Device) -> MasqResult<Device> {
        self.add(profile_id, device).await
    }

    /// Devices of a profile, in creation order
    pub async fn get_devices(&self, profile_id: &str) -> MasqResult<Vec<Device>> {
        self.list(profile_id).await
    }

    /// Replace a device record; it must carry the id of an existing device.
    pub async fn update_device(&self, profile_id: &str, device: Device) -> MasqResult<Device> {
        self.update(profile_id, device).await
    }

    async fn add<R: Resource>(&self, profile_id: &str, mut item: R) -> MasqResult<R> {
        let store = self.profile_store(profile_id).await?;
        let _guard = self.write_lock.lock().await;

        let id = self.new_id();
        item.set_id(id.clone());
        store
            .batch(vec![
                BatchOp::put(R::index_path(&id), &true)?,
                BatchOp::put(R::item_path(&id), &item)?,
            ])
            .await?;
        debug!(profile = %profile_id, kind = R::NAMESPACE, %id, "Item added");
        Ok(item)
    }

    /// Ids with a membership marker, in ULID (creation) order
    async fn ids<R: Resource>(store: &ReplicatedStore) -> MasqResult<Vec<String>> {
        let prefix = R::index_prefix();
        Ok(store
            .scan(&prefix)
            .await?
            .into_iter()
            .filter_map(|(path, _)| path.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn list<R: Resource>(&self, profile_id: &str) -> MasqResult<Vec<R>> {
        let store = self.profile_store(profile_id).await?;
        let ids = Self::ids::<R>(&store).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let item = store.get_as(&R::item_path(&id)).await?.ok_or_else(|| {
                MasqError::Store(format!("{} {} listed but missing", R::NAMESPACE, id))
            })?;
            out.push(item);
        }
        Ok(out)
    }

    async fn update<R: Resource>(&self, profile_id: &str, item: R) -> MasqResult<R> {
        let id = item.id().ok_or(MasqError::MissingId)?.to_string();
        let store = self.profile_store(profile_id).await?;
        let _guard = self.write_lock.lock().await;

        if store.get(&R::index_path(&id)).await?.is_none() {
            return Err(MasqError::Validation(format!(
                "No {} with id {}",
                R::NAMESPACE,
                id
            )));
        }
        store.put(&R::item_path(&id), &item).await?;
        debug!(profile = %profile_id, kind = R::NAMESPACE, %id, "Item updated");
        Ok(item)
    }
}

fn validate_profile(username: &str, firstname: &str, lastname: &str) -> MasqResult<()> {
    if !is_username(username) {
        return Err(MasqError::Validation(format!("Invalid username '{}'", username)));
    }
    for name in [firstname, lastname] {
        if !name.is_empty() && !is_name(name) {
            return Err(MasqError::Validation(format!("Invalid name '{}'", name)));
        }
    }
    Ok(())
}
