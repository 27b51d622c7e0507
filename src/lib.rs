//! # shardstore
//!
//! A shard lifecycle coordinator for content-addressed storage:
//! - single-writer event loop serializing all shard state transitions
//! - lazy or eager initialization, with one shared job for any number of
//!   concurrent acquirers
//! - crash recovery: records persisted after every transition, shards
//!   restored at startup, errored shards recovered on demand or on policy
//! - lossless tracing and failure notification sinks
//!
//! ## Architecture
//!
//! ```text
//!  callers ──────────► external ─┐
//!                                 │        ┌──────────────┐
//!  workers ──────────► completion ├──────► │  event loop  │──► metadata store
//!  (init/acquire)                 │        │ (one writer) │──► trace sink
//!  loop follow-ups ──► internal ──┘        └──────┬───────┘
//!  (drained first)                                │
//!                                                 ▼
//!                                            dispatcher ──► waiters,
//!                                                           failure sink
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use shardstore::common::CoordinatorConfig;
//! use shardstore::coordinator::metadata::MemMetaStore;
//! use shardstore::coordinator::{RegisterOpts, ShardCoordinator, Sinks};
//! use shardstore::storage::index::encode_records;
//! use shardstore::storage::{MemoryMount, MountRegistry};
//!
//! #[tokio::main]
//! async fn main() -> shardstore::Result<()> {
//!     let coordinator = ShardCoordinator::start(
//!         CoordinatorConfig::new("./shard-index"),
//!         Arc::new(MemMetaStore::new()),
//!         Arc::new(MountRegistry::new()),
//!         Sinks::default(),
//!     )
//!     .await?;
//!
//!     let payload = encode_records([b"hello".as_slice()]);
//!     let mount = Arc::new(MemoryMount::new("demo", payload));
//!     coordinator
//!         .register_shard("demo", mount, RegisterOpts::default())
//!         .await?;
//!
//!     let accessor = coordinator.acquire_shard(&"demo".into()).await?;
//!     assert_eq!(accessor.entry_count(), 1);
//!
//!     coordinator.close().await;
//!     Ok(())
//! }
//! ```

pub mod common;
pub mod coordinator;
pub mod storage;

// Re-export commonly used types
pub use common::{CoordinatorConfig, Error, RecoverPolicy, Result};
pub use coordinator::{
    RegisterOpts, ShardCoordinator, ShardInfo, ShardKey, ShardResult, ShardState, Sinks, Trace,
};
pub use storage::{Mount, MountRegistry, ShardAccessor};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
