//! Cache and artifact storage for pipeline runs.
//!
//! The engine talks to storage through the port traits in
//! `conveyor_core::ports`; this crate provides the key resolution rules,
//! the restore policy, the archive codec, and local/in-memory backends.

pub mod archive;
pub mod artifact;
pub mod cache;
pub mod keys;
pub mod memory;

pub use cache::{LocalCacheBackend, RestoreHit, restore};
pub use artifact::LocalArtifactBackend;
pub use memory::{MemoryArtifactBackend, MemoryCacheBackend};
