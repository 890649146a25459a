//! The device-side root: profiles, their apps and devices, and the pairing
//! flows that admit new apps and devices.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MasqConfig;
use crate::crypto::{CryptoProvider, SharedCrypto};
use crate::error::{MasqError, MasqResult};
use crate::pairing::{
    run_flow, ConsentPrompt, DeviceSync, Flow, MasqLogin, PairingHost, PairingLink,
    PairingOptions, PairingOutcome, Provision, StoreKind, SyncRole,
};
use crate::registry::ResourceRegistry;
use crate::replication::ReplicationManager;
use crate::store::{RedbBackend, SharedBackend, StorageBackend, StoreKey, StoreRegistry};
use crate::swarm::Rendezvous;
use crate::types::{app_store_name, App, AppRequest, Device, NewProfile, Profile, PublicProfile};

/// Backend key of this node's transport identity
const NODE_KEY: &str = "local/node-key";

/// Database file inside the data directory
pub const DB_FILE: &str = "masq.redb";

/// Open the on-disk backend in `data_dir`.
pub fn open_backend(data_dir: impl AsRef<Path>) -> MasqResult<SharedBackend> {
    Ok(Arc::new(RedbBackend::open(data_dir.as_ref().join(DB_FILE))?))
}

/// Transport secret for this node, created on first use.
pub fn node_secret(backend: &dyn StorageBackend, crypto: &dyn CryptoProvider) -> MasqResult<[u8; 32]> {
    if let Some(bytes) = backend.get(NODE_KEY)? {
        return bytes
            .try_into()
            .map_err(|_| MasqError::Store("Corrupt node key".to_string()));
    }
    let secret = crypto.random_32();
    backend.put(NODE_KEY, &secret)?;
    Ok(secret)
}

/// Device-side root component
pub struct Masq {
    config: MasqConfig,
    crypto: SharedCrypto,
    stores: Arc<StoreRegistry>,
    resources: ResourceRegistry,
    rendezvous: Arc<dyn Rendezvous>,
    replication: ReplicationManager,
    consent: Arc<dyn ConsentPrompt>,
    current: RwLock<Option<PublicProfile>>,
    cancel: CancellationToken,
}

impl Masq {
    /// Assemble a root over a backend and a rendezvous.
    pub fn new(
        config: MasqConfig,
        backend: SharedBackend,
        rendezvous: Arc<dyn Rendezvous>,
        consent: Arc<dyn ConsentPrompt>,
        crypto: SharedCrypto,
    ) -> Self {
        let stores = Arc::new(StoreRegistry::new(backend, crypto.clone()));
        let resources = ResourceRegistry::new(stores.clone(), config.kdf);
        Self {
            replication: ReplicationManager::new(rendezvous.clone()),
            config,
            crypto,
            stores,
            resources,
            rendezvous,
            consent,
            current: RwLock::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Open every known store and start replicating it.
    pub async fn init(&self) -> MasqResult<()> {
        let profiles = self.resources.index().profiles()?;
        for profile_id in &profiles {
            let store = self.stores.open_ready(profile_id).await?;
            self.replication.start(store).await?;

            for app in self.resources.get_apps(profile_id).await? {
                let Some(key) = app.store_key.as_deref() else {
                    continue;
                };
                let name = app_store_name(profile_id, &app.name);
                let store = self
                    .stores
                    .open_remote(&name, StoreKey::from_hex(key)?)
                    .await?;
                self.replication.start(store).await?;
            }
        }
        info!(profiles = profiles.len(), stores = self.stores.names().len(), "Masq initialized");
        Ok(())
    }

    /// Active configuration
    pub fn config(&self) -> &MasqConfig {
        &self.config
    }

    /// Resource registry
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Open stores
    pub fn stores(&self) -> &Arc<StoreRegistry> {
        &self.stores
    }

    /// Background replication
    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    /// Rendezvous used for pairing and replication
    pub fn rendezvous(&self) -> &Arc<dyn Rendezvous> {
        &self.rendezvous
    }

    /// Fresh pairing link that bootstraps through this node
    pub fn new_link(&self) -> PairingLink {
        let bootstrap = self.rendezvous.local_addr().into_iter().collect();
        PairingLink::generate(self.crypto.as_ref(), bootstrap)
    }

    /// Create a profile and start replicating its store.
    pub async fn add_profile(&self, new: NewProfile) -> MasqResult<PublicProfile> {
        let profile = self.resources.add_profile(new).await?;
        let store = self.stores.open_ready(&profile.id).await?;
        self.replication.start(store).await?;
        Ok(profile)
    }

    /// Every local profile
    pub async fn get_profiles(&self) -> MasqResult<Vec<PublicProfile>> {
        self.resources.get_profiles().await
    }

    /// Log in to a profile.
    pub async fn open_profile(&self, profile_id: &str, passphrase: &str) -> MasqResult<PublicProfile> {
        let profile = self.resources.unlock_profile(profile_id, passphrase).await?;
        let public = profile
            .to_public()
            .ok_or_else(|| MasqError::ProfileNotFound(profile_id.to_string()))?;
        info!(profile = %profile_id, "Profile opened");
        *self.current.write() = Some(public.clone());
        Ok(public)
    }

    /// Log out.
    pub fn close_profile(&self) {
        if let Some(profile) = self.current.write().take() {
            info!(profile = %profile.id, "Profile closed");
        }
    }

    /// The logged-in profile
    pub fn current_profile(&self) -> Option<PublicProfile> {
        self.current.read().clone()
    }

    fn require_profile(&self) -> MasqResult<String> {
        self.current
            .read()
            .as_ref()
            .map(|p| p.id.clone())
            .ok_or(MasqError::NoOpenProfile)
    }

    /// Update the logged-in profile
    pub async fn update_profile(&self, profile: Profile) -> MasqResult<PublicProfile> {
        let current = self.require_profile()?;
        let id = profile.id.clone().ok_or(MasqError::MissingId)?;
        if id != current {
            return Err(MasqError::Validation(
                "Only the open profile can be updated".to_string(),
            ));
        }
        let public = self.resources.update_profile(profile).await?;
        *self.current.write() = Some(public.clone());
        Ok(public)
    }

    /// Register an app on the open profile
    pub async fn add_app(&self, app: App) -> MasqResult<App> {
        self.resources.add_app(&self.require_profile()?, app).await
    }

    /// Apps of the open profile
    pub async fn get_apps(&self) -> MasqResult<Vec<App>> {
        self.resources.get_apps(&self.require_profile()?).await
    }

    /// Update an app of the open profile
    pub async fn update_app(&self, app: App) -> MasqResult<App> {
        self.resources.update_app(&self.require_profile()?, app).await
    }

    /// Register a device on the open profile
    pub async fn add_device(&self, device: Device) -> MasqResult<Device> {
        self.resources.add_device(&self.require_profile()?, device).await
    }

    /// Devices of the open profile
    pub async fn get_devices(&self) -> MasqResult<Vec<Device>> {
        self.resources.get_devices(&self.require_profile()?).await
    }

    /// Update a device of the open profile
    pub async fn update_device(&self, device: Device) -> MasqResult<Device> {
        self.resources.update_device(&self.require_profile()?, device).await
    }

    /// Answer an app login on the link's channel (the user is asked).
    pub async fn handle_user_app_login(&self, link: &PairingLink) -> MasqResult<PairingOutcome> {
        let profile_id = self.require_profile()?;
        self.pair(&MasqLogin, link, Some(profile_id)).await
    }

    /// Let another device join the open profile.
    pub async fn sync_profile(&self, link: &PairingLink, initiator: bool) -> MasqResult<PairingOutcome> {
        let profile_id = self.require_profile()?;
        let key = self.resources.profile_store(&profile_id).await?.key().await?;
        let flow = DeviceSync {
            role: SyncRole::Owner {
                profile_id: profile_id.clone(),
                key: key.to_hex(),
            },
            initiator,
        };
        self.pair(&flow, link, Some(profile_id)).await
    }

    /// Join a profile held by another device.
    ///
    /// The profile is added to the local index once access is granted;
    /// the grant itself arrives through replication.
    pub async fn join_profile(&self, link: &PairingLink, initiator: bool) -> MasqResult<PairingOutcome> {
        let flow = DeviceSync {
            role: SyncRole::Joiner,
            initiator,
        };
        let outcome = self.pair(&flow, link, None).await?;

        if let PairingOutcome::Granted { db_id } = &outcome {
            self.resources.index().add(db_id)?;
            let store = self
                .stores
                .get(db_id)
                .ok_or_else(|| MasqError::Store(format!("{}: not open", db_id)))?;
            let wait = PairingOptions::from(&self.config.pairing).round_trip_timeout;
            match timeout(wait, store.wait_writable()).await {
                Ok(result) => result?,
                Err(_) => warn!(profile = %db_id, "Write grant not replicated yet"),
            }
            info!(profile = %db_id, "Joined profile");
        }
        Ok(outcome)
    }

    /// Provision a store for a new app and hand it to the app on the
    /// link's channel.
    pub async fn create_app(&self, link: &PairingLink, app_name: &str) -> MasqResult<PairingOutcome> {
        let profile_id = self.require_profile()?;
        let (key, db_id) = self.app_store(&profile_id, app_name).await?;
        debug!(store = %db_id, "App store ready for provisioning");
        let flow = Provision {
            app_name: app_name.to_string(),
            db_id,
            key: key.to_hex(),
        };
        self.pair(&flow, link, Some(profile_id)).await
    }

    /// Open the store of an app, reusing the one on record if the app is
    /// already registered.
    async fn app_store(&self, profile_id: &str, app_name: &str) -> MasqResult<(StoreKey, String)> {
        let db_id = app_store_name(profile_id, app_name);
        let store = match self.resources.find_app(profile_id, app_name).await? {
            Some(App {
                store_key: Some(key),
                ..
            }) => {
                debug!(app = %app_name, "App already registered, reusing its store");
                self.stores
                    .open_remote(&db_id, StoreKey::from_hex(&key)?)
                    .await?
            }
            _ => self.stores.open_ready(&db_id).await?,
        };
        Ok((store.key().await?, db_id))
    }

    async fn pair<F: Flow>(
        &self,
        flow: &F,
        link: &PairingLink,
        profile_id: Option<String>,
    ) -> MasqResult<PairingOutcome> {
        self.rendezvous.add_peers(&link.bootstrap)?;
        let session = self.rendezvous.join(&link.channel).await?;
        let host = MasqHost {
            masq: self,
            profile_id,
        };
        run_flow(
            flow,
            session,
            &link.shared_key(),
            &host,
            &PairingOptions::from(&self.config.pairing),
            self.crypto.clone(),
            self.cancel.child_token(),
        )
        .await
    }

    /// Cancel pairing sessions and stop replication.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.replication.shutdown().await;
        self.close_profile();
        info!("Masq shut down");
    }
}

/// Executes pairing effects against the device's own state
struct MasqHost<'a> {
    masq: &'a Masq,
    profile_id: Option<String>,
}

impl MasqHost<'_> {
    fn profile_id(&self) -> MasqResult<&str> {
        self.profile_id.as_deref().ok_or(MasqError::NoOpenProfile)
    }
}

#[async_trait]
impl PairingHost for MasqHost<'_> {
    async fn request_consent(&self, request: &AppRequest) -> MasqResult<bool> {
        self.masq.consent.ask(request).await
    }

    async fn open_app_store(&self, app_name: &str) -> MasqResult<(StoreKey, String)> {
        self.masq.app_store(self.profile_id()?, app_name).await
    }

    async fn register_app(&self, db_id: &str, app: App) -> MasqResult<()> {
        let profile_id = self.profile_id()?;
        match self.masq.resources.find_app(profile_id, &app.name).await? {
            Some(existing) => {
                let updated = App {
                    id: existing.id,
                    ..app
                };
                self.masq.resources.update_app(profile_id, updated).await?;
            }
            None => {
                self.masq.resources.add_app(profile_id, app).await?;
            }
        }
        debug!(store = %db_id, "App registered");
        Ok(())
    }

    async fn authorize_writer(&self, db_id: &str, key: &str) -> MasqResult<()> {
        let key = StoreKey::from_hex(key)?;
        let store = self.masq.stores.open_ready(db_id).await?;
        if !store.authorize_writer(&key).await? {
            debug!(store = %db_id, writer = %key, "Writer was already authorized");
        }
        Ok(())
    }

    async fn join_store(&self, kind: StoreKind, key: &str, db_id: &str) -> MasqResult<StoreKey> {
        if kind != StoreKind::Profile {
            return Err(MasqError::InvalidOperation(
                "Devices only join profile stores".to_string(),
            ));
        }
        let store = self
            .masq
            .stores
            .open_remote(db_id, StoreKey::from_hex(key)?)
            .await?;
        store.local_key().await
    }

    async fn replicate(&self, db_id: &str) -> MasqResult<()> {
        let store = self.masq.stores.open_ready(db_id).await?;
        self.masq.replication.start(store).await
    }
}
