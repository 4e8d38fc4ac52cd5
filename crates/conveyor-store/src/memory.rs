//! In-memory backends for tests and dry runs.

use conveyor_core::ports::{ArtifactBackend, ArtifactFile, Blob, CacheBackend};
use conveyor_core::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct MemoryCacheState {
    seq: u64,
    /// key -> (save order, content)
    entries: HashMap<String, (u64, Blob)>,
}

/// Cache backend held entirely in memory.
#[derive(Default)]
pub struct MemoryCacheBackend {
    state: Mutex<MemoryCacheState>,
}

impl MemoryCacheBackend {
    pub fn keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut keys: Vec<_> = state.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Blob>> {
        let state = self.state.lock().unwrap();
        Ok(state.entries.get(key).map(|(_, blob)| blob.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Option<(String, Blob)>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .max_by_key(|(_, (seq, _))| *seq)
            .map(|(key, (_, blob))| (key.clone(), blob.clone())))
    }

    async fn put(&self, key: &str, blob: Blob) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.entries.contains_key(key) {
            return Ok(());
        }
        state.seq += 1;
        let seq = state.seq;
        state.entries.insert(key.to_string(), (seq, blob));
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.entries.contains_key(key))
    }
}

/// Artifact backend held entirely in memory.
#[derive(Default)]
pub struct MemoryArtifactBackend {
    bundles: Mutex<HashMap<String, Vec<ArtifactFile>>>,
}

#[async_trait]
impl ArtifactBackend for MemoryArtifactBackend {
    async fn put(&self, name: &str, files: Vec<ArtifactFile>) -> Result<()> {
        let mut bundles = self.bundles.lock().unwrap();
        bundles.insert(name.to_string(), files);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<ArtifactFile>>> {
        let bundles = self.bundles.lock().unwrap();
        Ok(bundles.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let bundles = self.bundles.lock().unwrap();
        let mut names: Vec<_> = bundles.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_returns_most_recent() {
        let backend = MemoryCacheBackend::default();
        backend.put("pip-a", b"1".to_vec()).await.unwrap();
        backend.put("pip-b", b"2".to_vec()).await.unwrap();

        let (key, blob) = backend.get_prefix("pip-").await.unwrap().unwrap();
        assert_eq!(key, "pip-b");
        assert_eq!(blob, b"2");
    }

    #[tokio::test]
    async fn test_put_duplicate_is_noop() {
        let backend = MemoryCacheBackend::default();
        backend.put("k", b"first".to_vec()).await.unwrap();
        backend.put("k", b"second".to_vec()).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_artifact_round_trip() {
        let backend = MemoryArtifactBackend::default();
        backend
            .put(
                "wheels-ubuntu",
                vec![ArtifactFile {
                    path: "dist/pkg.whl".into(),
                    contents: b"wheel".to_vec(),
                }],
            )
            .await
            .unwrap();

        assert_eq!(backend.list().await.unwrap(), vec!["wheels-ubuntu"]);
        let files = backend.get("wheels-ubuntu").await.unwrap().unwrap();
        assert_eq!(files[0].path, "dist/pkg.whl");
        assert!(backend.get("missing").await.unwrap().is_none());
    }
}
