//! Tar + zstd packing for cached paths.

use conveyor_core::{Error, Result};
use std::path::Path;

/// Pack a workspace-relative path into a compressed archive. A missing
/// path yields an empty archive rather than an error, matching the
/// behavior of caching a directory the job never populated.
pub fn pack(base_dir: &Path, path: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let encoder = zstd::stream::write::Encoder::new(&mut out, 3)
        .map_err(|e| Error::CacheBackend(format!("zstd init failed: {}", e)))?;
    let mut builder = tar::Builder::new(encoder);

    let abs = base_dir.join(path);
    if abs.exists() {
        if abs.is_dir() {
            builder
                .append_dir_all(path, &abs)
                .map_err(|e| Error::CacheBackend(format!("failed to pack dir: {}", e)))?;
        } else {
            builder
                .append_path_with_name(&abs, path)
                .map_err(|e| Error::CacheBackend(format!("failed to pack file: {}", e)))?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::CacheBackend(format!("failed to finish tar: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::CacheBackend(format!("zstd finish failed: {}", e)))?;
    Ok(out)
}

/// Unpack an archive produced by [`pack`] into the workspace.
pub fn unpack(bytes: &[u8], dest: &Path) -> Result<()> {
    let decoder = zstd::stream::read::Decoder::new(bytes)
        .map_err(|e| Error::CacheBackend(format!("zstd decode failed: {}", e)))?;
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest)
        .map_err(|e| Error::CacheBackend(format!("failed to unpack archive: {}", e)))?;
    Ok(())
}
