//! The set of open stores in one process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::{ReplicatedStore, SharedBackend, StoreKey};
use crate::crypto::SharedCrypto;
use crate::error::{MasqError, MasqResult};

/// Owns every open [`ReplicatedStore`] handle, at most one per name.
pub struct StoreRegistry {
    backend: SharedBackend,
    crypto: SharedCrypto,
    stores: Mutex<HashMap<String, Arc<ReplicatedStore>>>,
}

impl StoreRegistry {
    /// Create an empty registry over a backend.
    pub fn new(backend: SharedBackend, crypto: SharedCrypto) -> Self {
        Self {
            backend,
            crypto,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Open a store, creating it as a new identity if none exists yet.
    ///
    /// Repeated calls with the same name return the same handle.
    pub fn open(&self, name: &str) -> Arc<ReplicatedStore> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(name) {
            return store.clone();
        }
        info!(store = %name, "Opening store");
        let store =
            ReplicatedStore::spawn_open(name, self.backend.clone(), None, self.crypto.clone());
        stores.insert(name.to_string(), store.clone());
        store
    }

    /// Open a replica of a store identified by `key`.
    ///
    /// Fails with [`MasqError::StoreKeyMismatch`] when `name` is already bound
    /// to a different key.
    pub async fn open_remote(&self, name: &str, key: StoreKey) -> MasqResult<Arc<ReplicatedStore>> {
        let store = {
            let mut stores = self.stores.lock();
            match stores.get(name) {
                Some(store) => store.clone(),
                None => {
                    info!(store = %name, %key, "Opening store replica");
                    let store = ReplicatedStore::spawn_open(
                        name,
                        self.backend.clone(),
                        Some(key),
                        self.crypto.clone(),
                    );
                    stores.insert(name.to_string(), store.clone());
                    store
                }
            }
        };

        if let Err(e) = store.ready().await {
            self.evict(name, &store);
            return Err(e);
        }
        let existing = store.key().await?;
        if existing != key {
            return Err(MasqError::StoreKeyMismatch {
                name: name.to_string(),
                existing: existing.to_hex(),
            });
        }
        Ok(store)
    }

    /// Open a store and wait for it; failed loads are evicted so a later
    /// open can retry.
    pub async fn open_ready(&self, name: &str) -> MasqResult<Arc<ReplicatedStore>> {
        let store = self.open(name);
        if let Err(e) = store.ready().await {
            self.evict(name, &store);
            return Err(e);
        }
        Ok(store)
    }

    fn evict(&self, name: &str, store: &Arc<ReplicatedStore>) {
        let mut stores = self.stores.lock();
        if stores.get(name).is_some_and(|s| Arc::ptr_eq(s, store)) {
            stores.remove(name);
        }
    }

    /// Handle for an already-open store
    pub fn get(&self, name: &str) -> Option<Arc<ReplicatedStore>> {
        self.stores.lock().get(name).cloned()
    }

    /// Names of all open stores
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.stores.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Shared crypto provider
    pub fn crypto(&self) -> &SharedCrypto {
        &self.crypto
    }

    /// Shared backend
    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }
}
