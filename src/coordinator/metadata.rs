//! Metadata store for shard records
//!
//! Key-value storage behind the coordinator's persister. Deleting a key
//! that does not exist is success; the coordinator relies on that for
//! idempotent destroys.

use crate::common::Result;
use rocksdb::{Options, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

const CF_SHARDS: &str = "shards";

/// Trait for metadata storage backends
pub trait MetaStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Delete a key; missing keys are success
    fn delete(&self, key: &str) -> Result<()>;
    /// List all stored keys
    fn list(&self) -> Result<Vec<String>>;
    /// Flush to durable storage, where the backend has one
    fn flush(&self) -> Result<()>;
}

/// In-memory store, mainly for tests and ephemeral deployments
#[derive(Default)]
pub struct MemMetaStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemMetaStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.map.lock().unwrap().keys().cloned().collect())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// RocksDB-backed store
pub struct RocksMetaStore {
    db: DB,
}

impl RocksMetaStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_SHARDS])?;
        Ok(Self { db })
    }

    fn cf(&self) -> &rocksdb::ColumnFamily {
        // the column family is created in open()
        self.db.cf_handle(CF_SHARDS).unwrap()
    }
}

impl MetaStore for RocksMetaStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf(), key.as_bytes())?)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.put_cf(self.cf(), key.as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        // RocksDB deletes are blind; missing keys are already success
        self.db.delete_cf(self.cf(), key.as_bytes())?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let iter = self.db.iterator_cf(self.cf(), rocksdb::IteratorMode::Start);

        let mut keys = Vec::new();
        for item in iter {
            let (key_bytes, _) = item?;
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| crate::Error::MetadataCorrupted("invalid UTF-8 key".into()))?;
            keys.push(key);
        }

        Ok(keys)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
