//! Artifact collection and the local filesystem store.

use conveyor_core::ports::{ArtifactBackend, ArtifactFile};
use conveyor_core::{Error, Result};
use async_trait::async_trait;
use glob::Pattern;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Collect workspace files matching the include globs, minus anything
/// matching an exclude glob. Paths in the result are workspace-relative.
pub fn collect_files(
    workspace: &Path,
    patterns: &[String],
    exclude: &[String],
) -> Result<Vec<ArtifactFile>> {
    let exclude: Vec<Pattern> = exclude
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| Error::Definition(format!("bad exclude glob `{}`: {}", p, e)))
        })
        .collect::<Result<_>>()?;

    let mut files = Vec::new();
    for pattern in patterns {
        let full = workspace.join(pattern);
        let matches = glob::glob(&full.to_string_lossy())
            .map_err(|e| Error::Definition(format!("bad artifact glob `{}`: {}", pattern, e)))?;

        for entry in matches {
            let path = entry
                .map_err(|e| Error::ArtifactBackend(format!("glob walk failed: {}", e)))?;
            if !path.is_file() {
                continue;
            }
            let relative = path
                .strip_prefix(workspace)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            if exclude.iter().any(|p| p.matches(&relative)) {
                continue;
            }
            let contents = std::fs::read(&path)
                .map_err(|e| Error::ArtifactBackend(format!("failed to read {}: {}", relative, e)))?;
            files.push(ArtifactFile {
                path: relative,
                contents,
            });
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    files.dedup_by(|a, b| a.path == b.path);
    debug!(count = files.len(), "collected artifact files");
    Ok(files)
}

/// Filesystem-backed artifact store: one directory per bundle name.
pub struct LocalArtifactBackend {
    root: PathBuf,
}

impl LocalArtifactBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ArtifactBackend for LocalArtifactBackend {
    async fn put(&self, name: &str, files: Vec<ArtifactFile>) -> Result<()> {
        let bundle_dir = self.root.join(name);
        for file in &files {
            let dest = bundle_dir.join(&file.path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::ArtifactBackend(format!("failed to create artifact dir: {}", e))
                })?;
            }
            tokio::fs::write(&dest, &file.contents).await.map_err(|e| {
                Error::ArtifactBackend(format!("failed to write artifact: {}", e))
            })?;
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<ArtifactFile>>> {
        let bundle_dir = self.root.join(name);
        if !bundle_dir.is_dir() {
            return Ok(None);
        }
        let mut files = Vec::new();
        read_bundle(&bundle_dir, &bundle_dir, &mut files)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Some(files))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => {
                return Err(Error::ArtifactBackend(format!(
                    "failed to list artifacts: {}",
                    e
                )));
            }
        };
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::ArtifactBackend(format!("failed to list: {}", e)))?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn read_bundle(root: &Path, dir: &Path, out: &mut Vec<ArtifactFile>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::ArtifactBackend(format!("failed to read bundle: {}", e)))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::ArtifactBackend(format!("failed to read bundle: {}", e)))?;
        let path = entry.path();
        if path.is_dir() {
            read_bundle(root, &path, out)?;
        } else {
            let contents = std::fs::read(&path)
                .map_err(|e| Error::ArtifactBackend(format!("failed to read artifact: {}", e)))?;
            out.push(ArtifactFile {
                path: path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string(),
                contents,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        std::fs::write(dir.path().join("dist/pkg-1.0.whl"), b"whl").unwrap();
        std::fs::write(dir.path().join("dist/pkg-1.0.tar.gz"), b"sdist").unwrap();
        std::fs::write(dir.path().join("dist/junk.log"), b"log").unwrap();
        dir
    }

    #[test]
    fn test_collect_with_exclude() {
        let ws = setup_workspace();
        let files = collect_files(
            ws.path(),
            &["dist/*".to_string()],
            &["dist/*.log".to_string()],
        )
        .unwrap();

        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["dist/pkg-1.0.tar.gz", "dist/pkg-1.0.whl"]);
    }

    #[test]
    fn test_collect_skips_directories() {
        let ws = setup_workspace();
        let files = collect_files(ws.path(), &["*".to_string()], &[]).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_bad_glob_is_definition_error() {
        let ws = setup_workspace();
        let err = collect_files(ws.path(), &["dist/*".to_string()], &["[".to_string()])
            .unwrap_err();
        assert!(err.is_definition());
    }

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalArtifactBackend::new(root.path().to_path_buf());

        backend
            .put(
                "wheels",
                vec![
                    ArtifactFile {
                        path: "dist/a.whl".into(),
                        contents: b"a".to_vec(),
                    },
                    ArtifactFile {
                        path: "dist/b.whl".into(),
                        contents: b"b".to_vec(),
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(backend.list().await.unwrap(), vec!["wheels"]);
        let files = backend.get("wheels").await.unwrap().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "dist/a.whl");
        assert_eq!(files[0].contents, b"a");
    }
}
