//! Storage collaborators: mounts, indices, accessors

pub mod accessor;
pub mod index;
pub mod mount;

pub use accessor::ShardAccessor;
pub use index::{EntryLocation, IndexRepo, IndexStat, ShardIndex};
pub use mount::{
    FileMount, FileMountResolver, MemoryMount, MemoryMountResolver, Mount, MountRegistry,
    MountResolver,
};
