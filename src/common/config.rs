//! Configuration for the shard coordinator

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Directory holding full index snapshots
    pub index_dir: PathBuf,

    /// Capacity of the caller-facing task channel
    #[serde(default = "default_external_queue_depth")]
    pub external_queue_depth: usize,

    /// Capacity of the worker completion channel
    #[serde(default = "default_completion_queue_depth")]
    pub completion_queue_depth: usize,

    /// Capacity of each dispatch queue (results and failure notifications)
    #[serde(default = "default_dispatch_queue_depth")]
    pub dispatch_queue_depth: usize,

    /// What to do with shards restored in the errored state
    #[serde(default)]
    pub recover_policy: RecoverPolicy,
}

fn default_external_queue_depth() -> usize {
    128
}
fn default_completion_queue_depth() -> usize {
    64
}
fn default_dispatch_queue_depth() -> usize {
    128
}

/// Recovery policy for shards that come back errored after a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoverPolicy {
    /// Leave the shard errored; acquires fail until an explicit recover
    Never,
    /// Arm the shard so its next acquire triggers a recovery
    OnAcquire,
    /// Queue a recovery for every errored shard at startup
    Now,
}

impl Default for RecoverPolicy {
    fn default() -> Self {
        RecoverPolicy::OnAcquire
    }
}

impl CoordinatorConfig {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            external_queue_depth: default_external_queue_depth(),
            completion_queue_depth: default_completion_queue_depth(),
            dispatch_queue_depth: default_dispatch_queue_depth(),
            recover_policy: RecoverPolicy::default(),
        }
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoordinatorConfig = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Save to file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.index_dir.as_os_str().is_empty() {
            return Err(crate::Error::InvalidConfig("index_dir is required".into()));
        }
        if self.external_queue_depth == 0 {
            return Err(crate::Error::InvalidConfig(
                "external_queue_depth must be non-zero".into(),
            ));
        }
        if self.completion_queue_depth == 0 {
            return Err(crate::Error::InvalidConfig(
                "completion_queue_depth must be non-zero".into(),
            ));
        }
        if self.dispatch_queue_depth == 0 {
            return Err(crate::Error::InvalidConfig(
                "dispatch_queue_depth must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new("./shard-index")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_validate() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recover_policy, RecoverPolicy::OnAcquire);
    }

    #[test]
    fn test_zero_depth_rejected() {
        let mut config = CoordinatorConfig::default();
        config.external_queue_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = CoordinatorConfig::new(dir.path().join("idx"));
        config.recover_policy = RecoverPolicy::Now;
        config.to_file(&path).unwrap();

        let loaded = CoordinatorConfig::from_file(&path).unwrap();
        assert_eq!(loaded.index_dir, config.index_dir);
        assert_eq!(loaded.recover_policy, RecoverPolicy::Now);
        assert_eq!(loaded.external_queue_depth, 128);
    }
}
