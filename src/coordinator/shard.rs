//! Per-shard records: lifecycle state, waiters, persisted form

use crate::common::{Error, Result};
use crate::coordinator::metadata::MetaStore;
use crate::coordinator::task::Waiter;
use crate::storage::mount::Mount;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Prefix for shard records in the metadata store
pub(crate) const SHARD_META_PREFIX: &str = "shards/";

pub(crate) fn shard_meta_key(key: &ShardKey) -> String {
    format!("{}{}", SHARD_META_PREFIX, key.as_str())
}

/// Opaque stable shard identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey(String);

impl ShardKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShardKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    /// Registered, not yet initialized
    New,
    /// Initialization or recovery in flight
    Initializing,
    /// Index present, acquires are served
    Available,
    /// Last initialization or recovery failed
    Errored,
    /// Record removed; terminal
    Destroyed,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardState::New => "new",
            ShardState::Initializing => "initializing",
            ShardState::Available => "available",
            ShardState::Errored => "errored",
            ShardState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Observable snapshot of a shard record
#[derive(Debug, Clone)]
pub struct ShardInfo {
    pub state: ShardState,
    pub error: Option<Arc<Error>>,
    pub lazy: bool,
}

/// In-memory shard record.
///
/// The key is immutable; everything else lives behind the per-shard lock.
/// Only the event loop mutates the guarded fields; workers and info
/// snapshots take the lock read-style for a consistent view.
pub struct Shard {
    key: ShardKey,
    pub(crate) inner: Mutex<ShardInner>,
}

pub(crate) struct ShardInner {
    pub state: ShardState,
    pub err: Option<Arc<Error>>,
    pub lazy: bool,
    pub mount: Arc<dyn Mount>,
    pub w_register: Option<Waiter>,
    pub w_recover: Option<Waiter>,
    pub w_acquire: Vec<Waiter>,
    pub recover_on_next_acquire: bool,
}

impl Shard {
    pub(crate) fn new(key: ShardKey, mount: Arc<dyn Mount>, lazy: bool) -> Arc<Self> {
        Arc::new(Self {
            key,
            inner: Mutex::new(ShardInner {
                state: ShardState::New,
                err: None,
                lazy,
                mount,
                w_register: None,
                w_recover: None,
                w_acquire: Vec::new(),
                recover_on_next_acquire: false,
            }),
        })
    }

    /// Rebuild a record from its persisted form, e.g. at restore time.
    pub(crate) fn restored(
        persisted: &PersistedShard,
        mount: Arc<dyn Mount>,
        state: ShardState,
        recover_on_next_acquire: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: persisted.key.clone(),
            inner: Mutex::new(ShardInner {
                state,
                err: match state {
                    ShardState::Errored => persisted.error_as_err(),
                    _ => None,
                },
                lazy: persisted.lazy,
                mount,
                w_register: None,
                w_recover: None,
                w_acquire: Vec::new(),
                recover_on_next_acquire,
            }),
        })
    }

    pub fn key(&self) -> &ShardKey {
        &self.key
    }

    /// Snapshot the observable record under the lock.
    pub async fn info(&self) -> ShardInfo {
        let inner = self.inner.lock().await;
        ShardInfo {
            state: inner.state,
            error: inner.err.clone(),
            lazy: inner.lazy,
        }
    }
}

impl ShardInner {
    pub(crate) fn to_persisted(&self, key: &ShardKey) -> PersistedShard {
        PersistedShard {
            key: key.clone(),
            state: self.state,
            lazy: self.lazy,
            error: self.err.as_ref().map(|e| e.to_string()),
            mount_url: self.mount.url(),
        }
    }

    /// Write the record to the metadata store.
    pub(crate) fn persist(&self, key: &ShardKey, store: &dyn MetaStore) -> Result<()> {
        let persisted = self.to_persisted(key);
        let value = bincode::serialize(&persisted)
            .map_err(|e| Error::Internal(format!("serialize shard record: {}", e)))?;
        store.put(&shard_meta_key(key), &value)
    }

    /// Refresh the persistable fields from a stored record. Waiters and the
    /// live mount are untouched.
    pub(crate) fn reload_from(&mut self, persisted: &PersistedShard) {
        self.state = persisted.state;
        self.lazy = persisted.lazy;
        self.err = match persisted.state {
            ShardState::Errored => persisted.error_as_err(),
            _ => None,
        };
    }
}

/// Durable form of a shard record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistedShard {
    pub key: ShardKey,
    pub state: ShardState,
    pub lazy: bool,
    pub error: Option<String>,
    pub mount_url: String,
}

impl PersistedShard {
    pub(crate) fn decode(raw: &[u8]) -> Result<Self> {
        bincode::deserialize(raw).map_err(|e| Error::MetadataCorrupted(e.to_string()))
    }

    fn error_as_err(&self) -> Option<Arc<Error>> {
        self.error
            .as_ref()
            .map(|msg| Arc::new(Error::Other(msg.clone())))
    }
}

/// Fetch and decode the persisted record for a shard.
pub(crate) fn load_persisted(store: &dyn MetaStore, key: &ShardKey) -> Result<PersistedShard> {
    let raw = store
        .get(&shard_meta_key(key))?
        .ok_or_else(|| Error::ShardUnknown(key.to_string()))?;
    PersistedShard::decode(&raw)
}
