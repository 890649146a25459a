//! Pluggable byte storage behind every replicated store.
//!
//! Backends are plain string-keyed byte maps with an atomic batch write and a
//! prefix scan. All stores share one backend, namespaced by key prefix.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::MasqResult;

/// Single key/value table holding every store's feeds and metadata
const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Byte-addressable persistent storage.
pub trait StorageBackend: Send + Sync {
    /// Read one key
    fn get(&self, key: &str) -> MasqResult<Option<Vec<u8>>>;

    /// Write all pairs or none
    fn write_batch(&self, ops: &[(String, Vec<u8>)]) -> MasqResult<()>;

    /// All pairs whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &str) -> MasqResult<Vec<(String, Vec<u8>)>>;

    /// Write a single pair
    fn put(&self, key: &str, value: &[u8]) -> MasqResult<()> {
        self.write_batch(&[(key.to_string(), value.to_vec())])
    }
}

/// Shared handle to a backend
pub type SharedBackend = Arc<dyn StorageBackend>;

/// Volatile in-process backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty backend behind an `Arc`
    pub fn shared() -> SharedBackend {
        Arc::new(Self::new())
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> MasqResult<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn write_batch(&self, ops: &[(String, Vec<u8>)]) -> MasqResult<()> {
        let mut map = self.map.write();
        for (k, v) in ops {
            map.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> MasqResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .map
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// ACID backend on a redb file
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<RwLock<Database>>,
}

impl RedbBackend {
    /// Open or create the database at `path`.
    ///
    /// Creates the parent directory if needed.
    pub fn open(path: impl AsRef<Path>) -> MasqResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(KV_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

impl StorageBackend for RedbBackend {
    fn get(&self, key: &str) -> MasqResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;

        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn write_batch(&self, ops: &[(String, Vec<u8>)]) -> MasqResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            for (k, v) in ops {
                table.insert(k.as_str(), v.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> MasqResult<Vec<(String, Vec<u8>)>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;

        let mut out = Vec::new();
        for entry in table.range(prefix..)? {
            let (k, v) = entry?;
            if !k.value().starts_with(prefix) {
                break;
            }
            out.push((k.value().to_string(), v.value().to_vec()));
        }
        Ok(out)
    }
}
