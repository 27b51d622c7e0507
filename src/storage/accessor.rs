//! Read handles over acquired shards

use crate::coordinator::shard::ShardKey;
use crate::storage::index::ShardIndex;
use std::fmt;
use std::sync::Arc;

/// Read handle produced by a successful acquire.
///
/// Holds the fetched shard bytes and the full index; cheap to clone.
#[derive(Clone)]
pub struct ShardAccessor {
    key: ShardKey,
    bytes: Arc<Vec<u8>>,
    index: Arc<ShardIndex>,
}

impl ShardAccessor {
    pub(crate) fn new(key: ShardKey, bytes: Vec<u8>, index: ShardIndex) -> Self {
        Self {
            key,
            bytes: Arc::new(bytes),
            index: Arc::new(index),
        }
    }

    pub fn key(&self) -> &ShardKey {
        &self.key
    }

    /// Total shard size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of indexed entries.
    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// Look up an entry payload by content id.
    pub fn get(&self, content_id: &str) -> Option<&[u8]> {
        let loc = self.index.get(content_id)?;
        let start = loc.offset as usize;
        let end = start.checked_add(loc.size as usize)?;
        self.bytes.get(start..end)
    }

    /// Iterate over the content ids present in the shard.
    pub fn content_ids(&self) -> impl Iterator<Item = &str> {
        self.index.iter().map(|(id, _)| id.as_str())
    }
}

// Keep Debug output small; the payload can be large.
impl fmt::Debug for ShardAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardAccessor")
            .field("key", &self.key)
            .field("bytes", &self.bytes.len())
            .field("entries", &self.index.len())
            .finish()
    }
}
