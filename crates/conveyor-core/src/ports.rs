//! Port traits (hexagonal architecture).
//!
//! The engine never runs commands or touches storage itself; it drives
//! these interfaces and records what they report.

use crate::definition::DimensionAssignment;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Opaque stored content. The engine never inspects cache bytes.
pub type Blob = Vec<u8>;

/// A command handed to the external process runner.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub job: String,
    pub step: String,
    pub payload: String,
    pub assignment: DimensionAssignment,
    /// Environment derived from the instance identity and event context.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// External command execution collaborator. The engine only records the
/// exit status; it never interprets the payload.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutcome>;
}

/// Cache storage backend.
///
/// Keys are written exactly once per run per instance (derived from the
/// instance identity), so `put` treats an exact-key duplicate as a no-op
/// rather than overwriting.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Exact-key lookup.
    async fn get(&self, key: &str) -> Result<Option<Blob>>;

    /// Most recently saved entry whose key starts with `prefix`, with the
    /// matched key.
    async fn get_prefix(&self, prefix: &str) -> Result<Option<(String, Blob)>>;

    /// Store under `key`; no-op when an entry already exists for it.
    async fn put(&self, key: &str, blob: Blob) -> Result<()>;

    async fn contains(&self, key: &str) -> Result<bool>;
}

/// One file inside an artifact bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    /// Path relative to the workspace root.
    pub path: String,
    pub contents: Vec<u8>,
}

/// Artifact storage backend: named output bundles retained after an
/// instance completes.
#[async_trait]
pub trait ArtifactBackend: Send + Sync {
    async fn put(&self, name: &str, files: Vec<ArtifactFile>) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Option<Vec<ArtifactFile>>>;

    async fn list(&self) -> Result<Vec<String>>;
}
