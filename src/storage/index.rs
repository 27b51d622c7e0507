//! Full shard indices and their on-disk repository
//!
//! A shard is a sequence of length-prefixed entries:
//!
//! `[LEN:4][PAYLOAD:n] [LEN:4][PAYLOAD:m] ...`
//!
//! The full index maps the blake3 content id of each payload to its
//! location inside the shard. Indices are snapshotted to disk, one file
//! per shard, and looked up again by the acquirer workers.

use crate::common::{blake3_hex, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_MAGIC: &[u8; 8] = b"SHRDIDX1";

/// Location of one entry inside a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    /// Byte offset of the payload (past the length prefix)
    pub offset: u64,
    /// Payload size in bytes
    pub size: u64,
}

/// Result of a repository stat
#[derive(Debug, Clone, Copy)]
pub struct IndexStat {
    pub exists: bool,
    pub size: u64,
}

/// Full index for a single shard
#[derive(Debug, Default)]
pub struct ShardIndex {
    map: HashMap<String, EntryLocation>,
}

impl ShardIndex {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Scan a shard payload and index every entry by content id.
    pub fn build(bytes: &[u8]) -> Result<Self> {
        let mut index = ShardIndex::new();
        let mut offset = 0usize;

        while offset < bytes.len() {
            if offset + 4 > bytes.len() {
                return Err(crate::Error::Corrupted(
                    "truncated entry length prefix".into(),
                ));
            }
            let len_bytes: [u8; 4] = bytes[offset..offset + 4].try_into().unwrap();
            let len = u32::from_le_bytes(len_bytes) as usize;
            offset += 4;

            if offset + len > bytes.len() {
                return Err(crate::Error::Corrupted(format!(
                    "entry at offset {} overruns shard of {} bytes",
                    offset - 4,
                    bytes.len()
                )));
            }
            let payload = &bytes[offset..offset + len];
            index.insert(
                blake3_hex(payload),
                EntryLocation {
                    offset: offset as u64,
                    size: len as u64,
                },
            );
            offset += len;
        }

        Ok(index)
    }

    /// Insert or update an entry
    pub fn insert(&mut self, content_id: String, location: EntryLocation) {
        self.map.insert(content_id, location);
    }

    /// Get location for a content id
    pub fn get(&self, content_id: &str) -> Option<&EntryLocation> {
        self.map.get(content_id)
    }

    /// Check if a content id is present
    pub fn contains(&self, content_id: &str) -> bool {
        self.map.contains_key(content_id)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = (&String, &EntryLocation)> {
        self.map.iter()
    }

    /// Save index snapshot to file
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&(self.map.len() as u64).to_le_bytes())?;

        for (content_id, loc) in &self.map {
            let id_bytes = content_id.as_bytes();
            writer.write_all(&(id_bytes.len() as u32).to_le_bytes())?;
            writer.write_all(id_bytes)?;
            writer.write_all(&loc.offset.to_le_bytes())?;
            writer.write_all(&loc.size.to_le_bytes())?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Load index snapshot from file
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(crate::Error::Corrupted("invalid snapshot magic".into()));
        }

        let mut num_entries_bytes = [0u8; 8];
        reader.read_exact(&mut num_entries_bytes)?;
        let num_entries = u64::from_le_bytes(num_entries_bytes);

        let mut index = ShardIndex::new();

        for _ in 0..num_entries {
            let mut id_len_bytes = [0u8; 4];
            reader.read_exact(&mut id_len_bytes)?;
            let id_len = u32::from_le_bytes(id_len_bytes) as usize;

            let mut id_bytes = vec![0u8; id_len];
            reader.read_exact(&mut id_bytes)?;
            let content_id = String::from_utf8(id_bytes)
                .map_err(|_| crate::Error::Corrupted("invalid UTF-8 in content id".into()))?;

            let mut offset_bytes = [0u8; 8];
            reader.read_exact(&mut offset_bytes)?;
            let offset = u64::from_le_bytes(offset_bytes);

            let mut size_bytes = [0u8; 8];
            reader.read_exact(&mut size_bytes)?;
            let size = u64::from_le_bytes(size_bytes);

            index.insert(content_id, EntryLocation { offset, size });
        }

        Ok(index)
    }
}

/// Frame a list of payloads in the shard entry format.
pub fn encode_records<'a>(records: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(&(record.len() as u32).to_le_bytes());
        out.extend_from_slice(record);
    }
    out
}

/// Directory of full index snapshots, one file per shard
pub struct IndexRepo {
    dir: PathBuf,
}

impl IndexRepo {
    /// Open or create the repository directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // hex keeps arbitrary shard keys filesystem-safe
        self.dir.join(format!("{}.full.idx", hex::encode(key)))
    }

    /// Stat the full index for a shard
    pub fn stat_full_index(&self, key: &str) -> Result<IndexStat> {
        match std::fs::metadata(self.path_for(key)) {
            Ok(meta) => Ok(IndexStat {
                exists: true,
                size: meta.len(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(IndexStat {
                exists: false,
                size: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the full index for a shard
    pub fn get_full_index(&self, key: &str) -> Result<ShardIndex> {
        ShardIndex::load_snapshot(self.path_for(key))
    }

    /// Persist the full index for a shard
    pub fn save_full_index(&self, key: &str, index: &ShardIndex) -> Result<()> {
        index.save_snapshot(self.path_for(key))
    }

    /// Remove the full index for a shard; missing is success
    pub fn drop_full_index(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
