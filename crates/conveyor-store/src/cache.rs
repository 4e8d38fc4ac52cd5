//! Cache restore policy and the local filesystem backend.

use conveyor_core::ports::{Blob, CacheBackend};
use conveyor_core::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// A successful cache lookup.
#[derive(Debug, Clone)]
pub struct RestoreHit {
    /// The key the lookup actually matched.
    pub key: String,
    pub blob: Blob,
    /// True for a primary-key match; an exact hit suppresses the save at
    /// the end of the step.
    pub exact: bool,
}

/// Restore policy: exact match on the primary key first, then each
/// fallback prefix in declared order (most recent entry per prefix).
/// The policy never crosses axes: only the declared keys are tried.
pub async fn restore(
    backend: &dyn CacheBackend,
    key: &str,
    restore_keys: &[String],
) -> Result<Option<RestoreHit>> {
    if let Some(blob) = backend.get(key).await? {
        debug!(key, "cache exact hit");
        return Ok(Some(RestoreHit {
            key: key.to_string(),
            blob,
            exact: true,
        }));
    }

    for prefix in restore_keys {
        if let Some((matched, blob)) = backend.get_prefix(prefix).await? {
            debug!(prefix, matched, "cache prefix hit");
            return Ok(Some(RestoreHit {
                key: matched,
                blob,
                exact: false,
            }));
        }
    }

    debug!(key, "cache miss");
    Ok(None)
}

/// Filesystem-backed cache for local runs. One file per key, with key
/// characters unsafe in filenames replaced.
pub struct LocalCacheBackend {
    root: PathBuf,
}

impl LocalCacheBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_key(key))
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

#[async_trait]
impl CacheBackend for LocalCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Blob>> {
        match tokio::fs::read(self.key_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::CacheBackend(format!("failed to read cache: {}", e))),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Option<(String, Blob)>> {
        let sanitized = sanitize_key(prefix);
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::CacheBackend(format!(
                    "failed to read cache dir: {}",
                    e
                )));
            }
        };

        // Most recently saved entry wins; ties break on key order.
        let mut best: Option<(std::time::SystemTime, String)> = None;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| Error::CacheBackend(format!("failed to read cache entry: {}", e)))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&sanitized) {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            let newer = match &best {
                None => true,
                Some((t, n)) => modified > *t || (modified == *t && name > *n),
            };
            if newer {
                best = Some((modified, name));
            }
        }

        match best {
            Some((_, name)) => {
                let bytes = tokio::fs::read(self.root.join(&name))
                    .await
                    .map_err(|e| Error::CacheBackend(format!("failed to read cache: {}", e)))?;
                Ok(Some((name, bytes)))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, blob: Blob) -> Result<()> {
        let path = self.key_path(key);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::CacheBackend(format!("failed to stat cache: {}", e)))?
        {
            // Exact-key duplicate within a run; keep the first writer.
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::CacheBackend(format!("failed to create cache dir: {}", e)))?;
        tokio::fs::write(&path, blob)
            .await
            .map_err(|e| Error::CacheBackend(format!("failed to write cache: {}", e)))?;
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        tokio::fs::try_exists(self.key_path(key))
            .await
            .map_err(|e| Error::CacheBackend(format!("failed to stat cache: {}", e)))
    }
}
