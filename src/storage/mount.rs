//! Mounts: opaque byte sources backing a shard
//!
//! A mount produces the shard's bytes on demand and names itself with a
//! URL. The URL is what gets persisted with the shard record; at restore
//! time the registry upgrades it back into a live mount.

use crate::common::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// A source of shard bytes.
pub trait Mount: Send + Sync {
    /// Fetch the full shard payload.
    fn fetch(&self) -> Result<Vec<u8>>;

    /// Stable URL identifying this mount, e.g. `file:///data/shard.bin`.
    fn url(&self) -> String;
}

/// Mount backed by a file on the local filesystem.
pub struct FileMount {
    path: PathBuf,
}

impl FileMount {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Mount for FileMount {
    fn fetch(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).map_err(|e| {
            Error::Mount(format!("failed to read {}: {}", self.path.display(), e))
        })
    }

    fn url(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Mount serving bytes held in memory, addressed by name.
pub struct MemoryMount {
    name: String,
    bytes: Arc<Vec<u8>>,
}

impl MemoryMount {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes: Arc::new(bytes),
        }
    }
}

impl Mount for MemoryMount {
    fn fetch(&self) -> Result<Vec<u8>> {
        Ok(self.bytes.as_ref().clone())
    }

    fn url(&self) -> String {
        format!("mem://{}", self.name)
    }
}

/// Upgrades a persisted mount URL back into a live mount.
pub trait MountResolver: Send + Sync {
    fn resolve(&self, url: &str) -> Result<Arc<dyn Mount>>;
}

/// Registry of URL schemes to resolvers.
#[derive(Default)]
pub struct MountRegistry {
    resolvers: RwLock<HashMap<String, Arc<dyn MountResolver>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver for a scheme (e.g. `file`).
    pub fn register(&self, scheme: impl Into<String>, resolver: Arc<dyn MountResolver>) {
        self.resolvers
            .write()
            .unwrap()
            .insert(scheme.into(), resolver);
    }

    /// Resolve a mount URL through the registered resolver for its scheme.
    pub fn resolve(&self, url: &str) -> Result<Arc<dyn Mount>> {
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| Error::Mount(format!("malformed mount URL: {}", url)))?;

        let resolver = self
            .resolvers
            .read()
            .unwrap()
            .get(scheme)
            .cloned()
            .ok_or_else(|| Error::Mount(format!("no resolver for mount scheme: {}", scheme)))?;

        resolver.resolve(url)
    }
}

/// Resolver for `file://` mounts.
pub struct FileMountResolver;

impl MountResolver for FileMountResolver {
    fn resolve(&self, url: &str) -> Result<Arc<dyn Mount>> {
        let path = url
            .strip_prefix("file://")
            .ok_or_else(|| Error::Mount(format!("not a file URL: {}", url)))?;
        Ok(Arc::new(FileMount::new(path)))
    }
}

/// Resolver for `mem://` mounts, backed by a shelf of named payloads.
#[derive(Default)]
pub struct MemoryMountResolver {
    shelf: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl MemoryMountResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stock the shelf with a named payload.
    pub fn add(&self, name: impl Into<String>, bytes: Vec<u8>) {
        self.shelf
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(bytes));
    }
}

impl MountResolver for MemoryMountResolver {
    fn resolve(&self, url: &str) -> Result<Arc<dyn Mount>> {
        let name = url
            .strip_prefix("mem://")
            .ok_or_else(|| Error::Mount(format!("not a memory URL: {}", url)))?;
        let bytes = self
            .shelf
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Mount(format!("no memory payload named: {}", name)))?;
        Ok(Arc::new(MemoryMount {
            name: name.to_string(),
            bytes,
        }))
    }
}
