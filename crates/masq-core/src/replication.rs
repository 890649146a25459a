//! Background replication of open stores.
//!
//! Each store gets one task that joins the store's discovery channel and
//! replicates with every peer that shows up there, independent of any
//! pairing session.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MasqResult;
use crate::store::ReplicatedStore;
use crate::swarm::{Rendezvous, SwarmSession};

struct Replication {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the replication task of every store
pub struct ReplicationManager {
    rendezvous: Arc<dyn Rendezvous>,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<String, Replication>>,
}

impl ReplicationManager {
    /// Create a manager over a rendezvous
    pub fn new(rendezvous: Arc<dyn Rendezvous>) -> Self {
        Self {
            rendezvous,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start replicating `store`. A no-op if it is already running.
    pub async fn start(&self, store: Arc<ReplicatedStore>) -> MasqResult<()> {
        let name = store.name().to_string();
        if self.is_running(&name) {
            return Ok(());
        }

        let discovery = store.discovery_id().await?;
        let session = self.rendezvous.join(&discovery).await?;
        let cancel = self.cancel.child_token();

        let mut tasks = self.tasks.lock();
        // Lost a race with a concurrent start
        if tasks.get(&name).is_some_and(|r| !r.task.is_finished()) {
            return Ok(());
        }
        info!(store = %name, %discovery, "Replication started");
        let task = tokio::spawn(serve(store, session, cancel.clone()));
        tasks.insert(name, Replication { cancel, task });
        Ok(())
    }

    fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .get(name)
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Stop replicating one store
    pub fn stop(&self, name: &str) {
        if let Some(replication) = self.tasks.lock().remove(name) {
            replication.cancel.cancel();
            debug!(store = %name, "Replication stopped");
        }
    }

    /// Names of stores being replicated, sorted
    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, r)| !r.task.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Stop everything and wait for the tasks to end.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain().map(|(_, r)| r.task).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(store: Arc<ReplicatedStore>, mut session: SwarmSession, cancel: CancellationToken) {
    let mut peers = Vec::new();
    loop {
        let peer = tokio::select! {
            _ = cancel.cancelled() => break,
            peer = session.next_peer() => peer,
        };
        match peer {
            Ok(Some(peer)) => {
                let store = store.clone();
                let cancel = cancel.clone();
                let peer_id = peer.peer_id.clone();
                peers.push(tokio::spawn(async move {
                    if let Err(e) = store.replicate(peer.conn, cancel).await {
                        warn!(store = %store.name(), peer = %peer_id, error = %e, "Replication with peer failed");
                    }
                }));
            }
            Ok(None) => break,
            Err(e) => {
                warn!(store = %store.name(), error = %e, "Discovery error");
            }
        }
        peers.retain(|p: &JoinHandle<()>| !p.is_finished());
    }

    session.close();
    cancel.cancel();
    for peer in peers {
        let _ = peer.await;
    }
    debug!(store = %store.name(), "Replication task ended");
}
