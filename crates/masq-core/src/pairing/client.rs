//! App side of pairing: what a third-party app embeds to log in to a
//! user's device or accept a provisioned store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::app_login::AppLogin;
use super::link::PairingLink;
use super::machine::{Flow, PairingOutcome, StoreKind};
use super::provision::ProvisionRequest;
use super::session::{run_flow, PairingHost, PairingOptions};
use crate::crypto::SharedCrypto;
use crate::error::{MasqError, MasqResult, ProtocolError};
use crate::replication::ReplicationManager;
use crate::store::{ReplicatedStore, SharedBackend, StoreKey, StoreRegistry};
use crate::swarm::Rendezvous;
use crate::types::AppRequest;

/// A third-party app's pairing client
pub struct AppClient {
    app: AppRequest,
    stores: StoreRegistry,
    rendezvous: Arc<dyn Rendezvous>,
    replication: ReplicationManager,
    options: PairingOptions,
    crypto: SharedCrypto,
    cancel: CancellationToken,
}

struct ClientHost<'a> {
    client: &'a AppClient,
}

#[async_trait]
impl PairingHost for ClientHost<'_> {
    async fn join_store(&self, kind: StoreKind, key: &str, db_id: &str) -> MasqResult<StoreKey> {
        if kind != StoreKind::App {
            return Err(MasqError::InvalidOperation(
                "Apps only join app stores".to_string(),
            ));
        }
        let key = StoreKey::from_hex(key)?;
        let store = self.client.stores.open_remote(db_id, key).await?;
        store.local_key().await
    }

    async fn replicate(&self, db_id: &str) -> MasqResult<()> {
        let store = self.client.store(db_id).ok_or_else(|| {
            MasqError::Store(format!("{}: not open", db_id))
        })?;
        self.client.replication.start(store).await
    }
}

impl AppClient {
    /// Create a client with its own stores.
    pub fn new(
        app: AppRequest,
        backend: SharedBackend,
        rendezvous: Arc<dyn Rendezvous>,
        options: PairingOptions,
        crypto: SharedCrypto,
    ) -> Self {
        Self {
            app,
            stores: StoreRegistry::new(backend, crypto.clone()),
            replication: ReplicationManager::new(rendezvous.clone()),
            rendezvous,
            options,
            crypto,
            cancel: CancellationToken::new(),
        }
    }

    /// What this app presents to the user
    pub fn app(&self) -> &AppRequest {
        &self.app
    }

    /// A store this client has joined
    pub fn store(&self, db_id: &str) -> Option<Arc<ReplicatedStore>> {
        self.stores.get(db_id)
    }

    /// Log in through a link the user's device is listening on.
    ///
    /// On a grant, returns once the store accepts this app's writes.
    pub async fn login(&self, link: &PairingLink) -> MasqResult<PairingOutcome> {
        let flow = AppLogin {
            app: self.app.clone(),
        };
        self.run(&flow, link).await
    }

    /// Accept a store provisioned by the user's device, keeping it locally
    /// as `store_name`.
    pub async fn provision(&self, link: &PairingLink, store_name: &str) -> MasqResult<PairingOutcome> {
        let flow = ProvisionRequest {
            app: self.app.clone(),
            store_name: store_name.to_string(),
        };
        self.run(&flow, link).await
    }

    async fn run<F: Flow>(&self, flow: &F, link: &PairingLink) -> MasqResult<PairingOutcome> {
        self.rendezvous.add_peers(&link.bootstrap)?;
        let session = self.rendezvous.join(&link.channel).await?;
        let host = ClientHost { client: self };
        let outcome = run_flow(
            flow,
            session,
            &link.shared_key(),
            &host,
            &self.options,
            self.crypto.clone(),
            self.cancel.child_token(),
        )
        .await?;

        if let PairingOutcome::Granted { db_id } = &outcome {
            self.await_writable(db_id).await?;
        }
        Ok(outcome)
    }

    async fn await_writable(&self, db_id: &str) -> MasqResult<()> {
        let store = self
            .store(db_id)
            .ok_or_else(|| MasqError::Store(format!("{}: not open", db_id)))?;
        match timeout(self.options.round_trip_timeout, store.wait_writable()).await {
            Ok(result) => {
                result?;
                info!(store = %db_id, "Write access confirmed");
                Ok(())
            }
            Err(_) => {
                warn!(store = %db_id, "Grant not replicated in time");
                Err(ProtocolError::Timeout("awaiting write grant".to_string()).into())
            }
        }
    }

    /// Cancel pairing sessions and stop replication.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.replication.shutdown().await;
    }
}
