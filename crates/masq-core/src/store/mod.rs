//! Replicated, authenticated key/value stores.
//!
//! A store is a set of per-writer signed feeds. The materialized view is a
//! last-writer-wins map over document paths, ordered by [`Stamp`], so any two
//! replicas holding the same entries produce the same view regardless of the
//! order the entries arrived in.
//!
//! The creator's ed25519 public key is the store's identity. Further writers
//! are granted by `Authorize` entries and are never removed.
//!
//! ```ignore
//! let registry = StoreRegistry::new(MemoryBackend::shared(), os_crypto());
//! let store = registry.open("profile-01H...");
//! store.ready().await?;
//! store.put("/", &serde_json::json!({"username": "jdoe"})).await?;
//! ```

mod backend;
mod entry;
mod registry;
mod replicate;

pub use backend::{MemoryBackend, RedbBackend, SharedBackend, StorageBackend};
pub use entry::{EntryBody, Op, Put, SignedEntry, Stamp, WriterId, GENESIS};
pub use registry::StoreRegistry;
pub use replicate::ReplicationMessage;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::crypto::SharedCrypto;
use crate::error::{MasqError, MasqResult};

/// Entries held back waiting for a predecessor or an authorization
const MAX_PENDING: usize = 10_000;

/// Capacity of the live entry feed used by replication sessions
const EVENT_CAPACITY: usize = 1024;

/// Public identity of a store (the creator's ed25519 key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreKey(pub [u8; 32]);

impl StoreKey {
    /// Hex form used in protocol messages and records
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse and validate a hex ed25519 public key.
    pub fn from_hex(s: &str) -> MasqResult<Self> {
        let bytes: [u8; 32] = hex::decode(s.trim())
            .map_err(|e| MasqError::InvalidWriterKey(format!("not hex: {}", e)))?
            .try_into()
            .map_err(|_| MasqError::InvalidWriterKey("expected 32 bytes".to_string()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| MasqError::InvalidWriterKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Rendezvous channel for passive replication of this store
    pub fn discovery_id(&self) -> String {
        hex::encode(discovery_hash(&self.0))
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub(crate) fn discovery_hash(key: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"masq-store-discovery-v1");
    hasher.update(key);
    *hasher.finalize().as_bytes()
}

/// Lifecycle of a store handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    /// Loading from the backend
    Pending,
    /// Identity established, operations allowed
    Ready,
    /// Loading failed; the handle is unusable
    Failed(String),
}

/// Persisted identity of a local handle
#[derive(Serialize, Deserialize)]
struct StoreMeta {
    key: [u8; 32],
    secret: [u8; 32],
}

/// One value in the view, with the stamp that wrote it
#[derive(Debug, Clone)]
struct Cell {
    stamp: Stamp,
    value: String,
}

enum Verdict {
    Accept,
    Duplicate,
    Defer,
    Reject(String),
}

/// In-memory state of a loaded store
#[derive(Clone)]
struct StoreState {
    key: [u8; 32],
    local: SigningKey,
    writers: BTreeSet<WriterId>,
    feeds: HashMap<WriterId, Vec<SignedEntry>>,
    pending: Vec<SignedEntry>,
    view: BTreeMap<String, Cell>,
    clock: u64,
}

impl StoreState {
    fn new(key: [u8; 32], local: SigningKey) -> Self {
        let mut writers = BTreeSet::new();
        writers.insert(key);
        Self {
            key,
            local,
            writers,
            feeds: HashMap::new(),
            pending: Vec::new(),
            view: BTreeMap::new(),
            clock: 0,
        }
    }

    fn local_id(&self) -> WriterId {
        self.local.verifying_key().to_bytes()
    }

    fn feed_len(&self, writer: &WriterId) -> u64 {
        self.feeds.get(writer).map(|f| f.len() as u64).unwrap_or(0)
    }

    fn feed_head(&self, writer: &WriterId) -> [u8; 32] {
        self.feeds
            .get(writer)
            .and_then(|f| f.last())
            .map(|e| e.hash())
            .unwrap_or(GENESIS)
    }

    fn heads(&self) -> Vec<(WriterId, u64)> {
        let mut heads: Vec<_> = self
            .feeds
            .iter()
            .map(|(w, f)| (*w, f.len() as u64))
            .collect();
        heads.sort();
        heads
    }

    fn classify(&self, entry: &SignedEntry) -> Verdict {
        if let Err(e) = entry.verify() {
            return Verdict::Reject(e.to_string());
        }
        let writer = entry.body.writer;
        let len = self.feed_len(&writer);
        let seq = entry.body.seq;

        if seq < len {
            let existing = &self.feeds[&writer][seq as usize];
            return if existing.hash() == entry.hash() {
                Verdict::Duplicate
            } else {
                Verdict::Reject(format!("fork at seq {}", seq))
            };
        }
        if seq > len {
            return Verdict::Defer;
        }
        if entry.body.prev != self.feed_head(&writer) {
            return Verdict::Reject("prev hash does not match feed head".to_string());
        }
        if !self.writers.contains(&writer) {
            return Verdict::Defer;
        }
        Verdict::Accept
    }

    fn apply(&mut self, entry: &SignedEntry) {
        self.clock = self.clock.max(entry.body.clock);
        let stamp = entry.stamp();
        match &entry.body.op {
            Op::Batch(puts) => {
                for put in puts {
                    let newer = self
                        .view
                        .get(&put.path)
                        .map(|cell| stamp > cell.stamp)
                        .unwrap_or(true);
                    if newer {
                        self.view.insert(
                            put.path.clone(),
                            Cell {
                                stamp,
                                value: put.value.clone(),
                            },
                        );
                    }
                }
            }
            Op::Authorize { key } => {
                self.writers.insert(*key);
            }
        }
        self.feeds
            .entry(entry.body.writer)
            .or_default()
            .push(entry.clone());
    }

    /// Accept whatever can be accepted; returns newly accepted entries in
    /// acceptance order.
    fn ingest(&mut self, entries: Vec<SignedEntry>) -> Vec<SignedEntry> {
        self.pending.extend(entries);
        let mut accepted = Vec::new();

        loop {
            let mut progressed = false;
            for entry in std::mem::take(&mut self.pending) {
                match self.classify(&entry) {
                    Verdict::Accept => {
                        self.apply(&entry);
                        accepted.push(entry);
                        progressed = true;
                    }
                    Verdict::Duplicate => {}
                    Verdict::Defer => self.pending.push(entry),
                    Verdict::Reject(reason) => {
                        warn!(
                            writer = %hex::encode(entry.body.writer),
                            seq = entry.body.seq,
                            %reason,
                            "Rejected store entry"
                        );
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        if self.pending.len() > MAX_PENDING {
            let excess = self.pending.len() - MAX_PENDING;
            warn!(dropped = excess, "Pending entry queue full");
            self.pending.drain(..excess);
        }

        accepted
    }

    fn build_local(&self, op: Op) -> MasqResult<SignedEntry> {
        let writer = self.local_id();
        let body = EntryBody {
            writer,
            seq: self.feed_len(&writer),
            clock: self.clock + 1,
            prev: self.feed_head(&writer),
            op,
        };
        SignedEntry::sign(body, &self.local)
    }

    fn version(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.key);
        for (writer, len) in self.heads() {
            hasher.update(&writer);
            hasher.update(&len.to_be_bytes());
            hasher.update(&self.feed_head(&writer));
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// A single put inside an atomic batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOp {
    /// Document path
    pub path: String,
    /// New value
    pub value: serde_json::Value,
}

impl BatchOp {
    /// Build a put from any serializable value.
    pub fn put<T: Serialize>(path: impl Into<String>, value: &T) -> MasqResult<Self> {
        Ok(Self {
            path: path.into(),
            value: serde_json::to_value(value)?,
        })
    }
}

/// Handle to one replicated store.
///
/// Cloning the `Arc` shares the handle; a [`StoreRegistry`] guarantees at
/// most one handle per name.
pub struct ReplicatedStore {
    name: String,
    backend: SharedBackend,
    ready_tx: watch::Sender<ReadyState>,
    state: RwLock<Option<StoreState>>,
    events: broadcast::Sender<SignedEntry>,
}

impl fmt::Debug for ReplicatedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedStore")
            .field("name", &self.name)
            .field("state", &*self.ready_tx.borrow())
            .finish()
    }
}

impl ReplicatedStore {
    /// Create a handle and start loading it in the background.
    ///
    /// With `remote` set, a missing store is created as a replica of that key
    /// rather than as a new identity. Must be called inside a tokio runtime.
    pub(crate) fn spawn_open(
        name: &str,
        backend: SharedBackend,
        remote: Option<StoreKey>,
        crypto: SharedCrypto,
    ) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(ReadyState::Pending);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Arc::new(Self {
            name: name.to_string(),
            backend,
            ready_tx,
            state: RwLock::new(None),
            events,
        });

        let loader = store.clone();
        tokio::task::spawn_blocking(move || {
            let result = loader.load(remote, &crypto);
            let next = match result {
                Ok(state) => {
                    debug!(
                        store = %loader.name,
                        key = %hex::encode(state.key),
                        entries = state.feeds.values().map(Vec::len).sum::<usize>(),
                        "Store ready"
                    );
                    *loader.state.write() = Some(state);
                    ReadyState::Ready
                }
                Err(e) => {
                    warn!(store = %loader.name, error = %e, "Store failed to load");
                    ReadyState::Failed(e.to_string())
                }
            };
            loader.ready_tx.send_replace(next);
        });

        store
    }

    fn prefix(&self) -> String {
        format!("store/{}/", hex::encode(self.name.as_bytes()))
    }

    fn meta_key(&self) -> String {
        format!("{}meta", self.prefix())
    }

    fn feed_prefix(&self) -> String {
        format!("{}feed/", self.prefix())
    }

    fn entry_key(&self, entry: &SignedEntry) -> String {
        format!(
            "{}{}/{:016x}",
            self.feed_prefix(),
            hex::encode(entry.body.writer),
            entry.body.seq
        )
    }

    fn load(&self, remote: Option<StoreKey>, crypto: &SharedCrypto) -> MasqResult<StoreState> {
        let meta = match self.backend.get(&self.meta_key())? {
            Some(bytes) => {
                let meta: StoreMeta = postcard::from_bytes(&bytes)?;
                if let Some(remote) = remote {
                    if remote.0 != meta.key {
                        return Err(MasqError::StoreKeyMismatch {
                            name: self.name.clone(),
                            existing: hex::encode(meta.key),
                        });
                    }
                }
                meta
            }
            None => {
                let secret = crypto.random_32();
                let local = SigningKey::from_bytes(&secret);
                let key = remote
                    .map(|k| k.0)
                    .unwrap_or_else(|| local.verifying_key().to_bytes());
                let meta = StoreMeta { key, secret };
                self.backend
                    .put(&self.meta_key(), &postcard::to_allocvec(&meta)?)?;
                meta
            }
        };

        let mut state = StoreState::new(meta.key, SigningKey::from_bytes(&meta.secret));
        let mut entries = Vec::new();
        for (_, bytes) in self.backend.scan_prefix(&self.feed_prefix())? {
            entries.push(postcard::from_bytes::<SignedEntry>(&bytes)?);
        }
        state.ingest(entries);
        Ok(state)
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state without waiting
    pub fn ready_state(&self) -> ReadyState {
        self.ready_tx.borrow().clone()
    }

    /// Wait until the store identity is established.
    pub async fn ready(&self) -> MasqResult<()> {
        let mut rx = self.ready_tx.subscribe();
        let state = rx
            .wait_for(|s| *s != ReadyState::Pending)
            .await
            .map_err(|_| MasqError::Store(format!("{}: loader went away", self.name)))?
            .clone();
        match state {
            ReadyState::Failed(reason) => Err(MasqError::Store(reason)),
            _ => Ok(()),
        }
    }

    async fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> MasqResult<R> {
        self.ready().await?;
        let guard = self.state.read();
        let state = guard
            .as_ref()
            .ok_or_else(|| MasqError::Store(format!("{}: not loaded", self.name)))?;
        Ok(f(state))
    }

    /// Public key of the store
    pub async fn key(&self) -> MasqResult<StoreKey> {
        self.read(|s| StoreKey(s.key)).await
    }

    /// This handle's writer key
    pub async fn local_key(&self) -> MasqResult<StoreKey> {
        self.read(|s| StoreKey(s.local_id())).await
    }

    /// Rendezvous channel for background replication
    pub async fn discovery_id(&self) -> MasqResult<String> {
        Ok(self.key().await?.discovery_id())
    }

    /// Content-addressed root over all feed heads
    pub async fn version(&self) -> MasqResult<String> {
        self.read(StoreState::version).await
    }

    /// Whether this handle may append
    pub async fn is_writable(&self) -> MasqResult<bool> {
        self.read(|s| s.writers.contains(&s.local_id())).await
    }

    /// Wait until the local writer has been authorized, typically by an
    /// entry replicated from the store owner. Callers bound this with a
    /// timeout.
    pub async fn wait_writable(&self) -> MasqResult<()> {
        let mut events = self.subscribe();
        loop {
            if self.is_writable().await? {
                return Ok(());
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(MasqError::Store(format!("{}: store closed", self.name)))
                }
            }
        }
    }

    /// Whether `key` is an authorized writer
    pub async fn is_authorized(&self, key: &StoreKey) -> MasqResult<bool> {
        self.read(|s| s.writers.contains(&key.0)).await
    }

    /// All authorized writers, sorted
    pub async fn writers(&self) -> MasqResult<Vec<StoreKey>> {
        self.read(|s| s.writers.iter().map(|w| StoreKey(*w)).collect())
            .await
    }

    /// Read the JSON value at `path`.
    pub async fn get(&self, path: &str) -> MasqResult<Option<serde_json::Value>> {
        let raw = self
            .read(|s| s.view.get(path).map(|cell| cell.value.clone()))
            .await?;
        raw.map(|v| serde_json::from_str(&v).map_err(MasqError::from))
            .transpose()
    }

    /// Every path under `prefix` with its JSON value, in path order.
    pub async fn scan(&self, prefix: &str) -> MasqResult<Vec<(String, serde_json::Value)>> {
        let raw = self
            .read(|s| {
                s.view
                    .range(prefix.to_string()..)
                    .take_while(|(path, _)| path.starts_with(prefix))
                    .map(|(path, cell)| (path.clone(), cell.value.clone()))
                    .collect::<Vec<_>>()
            })
            .await?;
        raw.into_iter()
            .map(|(path, v)| Ok((path, serde_json::from_str(&v)?)))
            .collect()
    }

    /// Read and deserialize the value at `path`.
    pub async fn get_as<T: DeserializeOwned>(&self, path: &str) -> MasqResult<Option<T>> {
        self.get(path)
            .await?
            .map(|v| serde_json::from_value(v).map_err(MasqError::from))
            .transpose()
    }

    /// Write one value.
    pub async fn put<T: Serialize>(&self, path: &str, value: &T) -> MasqResult<()> {
        self.batch(vec![BatchOp::put(path, value)?]).await
    }

    /// Apply all puts as a single entry.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> MasqResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let puts = ops
            .into_iter()
            .map(|op| {
                Ok(Put {
                    path: op.path,
                    value: serde_json::to_string(&op.value)?,
                })
            })
            .collect::<MasqResult<Vec<_>>>()?;
        self.append(Op::Batch(puts)).await
    }

    /// Grant write access to `key`.
    ///
    /// Returns `false` when the key was already authorized; no entry is
    /// written in that case.
    pub async fn authorize_writer(&self, key: &StoreKey) -> MasqResult<bool> {
        VerifyingKey::from_bytes(&key.0)
            .map_err(|e| MasqError::InvalidWriterKey(e.to_string()))?;
        if self.is_authorized(key).await? {
            debug!(store = %self.name, writer = %key, "Writer already authorized");
            return Ok(false);
        }
        self.append(Op::Authorize { key: key.0 }).await?;
        debug!(store = %self.name, writer = %key, "Writer authorized");
        Ok(true)
    }

    async fn append(&self, op: Op) -> MasqResult<()> {
        self.ready().await?;
        let accepted = {
            let mut guard = self.state.write();
            let state = guard
                .as_mut()
                .ok_or_else(|| MasqError::Store(format!("{}: not loaded", self.name)))?;

            if !state.writers.contains(&state.local_id()) {
                return Err(MasqError::NotWritable(self.name.clone()));
            }
            // An authorize for an already-present key is a no-op
            if let Op::Authorize { key } = &op {
                if state.writers.contains(key) {
                    return Ok(());
                }
            }

            let entry = state.build_local(op)?;
            self.commit(state, vec![entry])?
        };
        self.publish(accepted);
        Ok(())
    }

    /// Ingest entries received from a peer; returns how many were new.
    pub async fn ingest(&self, entries: Vec<SignedEntry>) -> MasqResult<usize> {
        self.ready().await?;
        let accepted = {
            let mut guard = self.state.write();
            let state = guard
                .as_mut()
                .ok_or_else(|| MasqError::Store(format!("{}: not loaded", self.name)))?;
            self.commit(state, entries)?
        };
        let count = accepted.len();
        self.publish(accepted);
        Ok(count)
    }

    /// Apply entries and persist every one that was accepted, including
    /// held entries they unblocked.
    ///
    /// Entries are applied to a staged copy; `state` only changes once the
    /// backend write has succeeded.
    fn commit(
        &self,
        state: &mut StoreState,
        entries: Vec<SignedEntry>,
    ) -> MasqResult<Vec<SignedEntry>> {
        let mut staged = state.clone();
        let accepted = staged.ingest(entries);
        if !accepted.is_empty() {
            let ops = accepted
                .iter()
                .map(|e| Ok((self.entry_key(e), postcard::to_allocvec(e)?)))
                .collect::<MasqResult<Vec<_>>>()?;
            self.backend.write_batch(&ops)?;
        }
        *state = staged;
        Ok(accepted)
    }

    fn publish(&self, accepted: Vec<SignedEntry>) {
        for entry in accepted {
            // No receivers is fine
            let _ = self.events.send(entry);
        }
    }

    /// Per-writer feed lengths
    pub(crate) async fn heads(&self) -> MasqResult<Vec<(WriterId, u64)>> {
        self.read(StoreState::heads).await
    }

    /// Entries the holder of `heads` is missing
    pub(crate) async fn missing_for(
        &self,
        heads: &HashMap<WriterId, u64>,
    ) -> MasqResult<Vec<SignedEntry>> {
        self.read(|s| {
            let mut out = Vec::new();
            for (writer, feed) in &s.feeds {
                let have = heads.get(writer).copied().unwrap_or(0) as usize;
                if have < feed.len() {
                    out.extend(feed[have..].iter().cloned());
                }
            }
            out
        })
        .await
    }

    /// Every accepted entry, feed by feed
    pub async fn entries(&self) -> MasqResult<Vec<SignedEntry>> {
        self.missing_for(&HashMap::new()).await
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SignedEntry> {
        self.events.subscribe()
    }
}
