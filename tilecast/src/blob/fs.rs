//! Filesystem blob store.
//!
//! Objects live as plain files under a root directory, mirroring the tile
//! path layout. Writes go through a temp file and rename so readers never
//! observe a partial PNG.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::{BlobStats, BlobStore, BlobStoreError, BoxFuture};

/// Blob store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Creates a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobStoreError> {
        if path.is_empty()
            || path.starts_with('/')
            || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(BlobStoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(path))
    }

    /// Splits a prefix into its directory part and an optional file-name
    /// prefix remainder.
    fn split_prefix(prefix: &str) -> (&str, &str) {
        match prefix.rfind('/') {
            Some(idx) => (&prefix[..idx], &prefix[idx + 1..]),
            None => ("", prefix),
        }
    }
}

fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, u64)>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_files(&entry.path(), out)?;
        } else {
            out.push((entry.path(), meta.len()));
        }
    }
    Ok(())
}

fn io_err(e: std::io::Error) -> BlobStoreError {
    BlobStoreError::Backend(e.to_string())
}

impl BlobStore for FsBlobStore {
    fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        _ttl_hint: Duration,
    ) -> BoxFuture<'_, Result<(), BlobStoreError>> {
        let resolved = self.resolve(path);
        Box::pin(async move {
            let full = resolved?;
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
            let tmp = full.with_extension("png.tmp");
            tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
            tokio::fs::rename(&tmp, &full).await.map_err(io_err)?;
            debug!(path = %full.display(), size = bytes.len(), "blob written");
            Ok(())
        })
    }

    fn get(&self, path: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, BlobStoreError>> {
        let resolved = self.resolve(path);
        Box::pin(async move {
            let full = resolved?;
            match tokio::fs::read(&full).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(io_err(e)),
            }
        })
    }

    fn exists(&self, path: &str) -> BoxFuture<'_, Result<bool, BlobStoreError>> {
        let resolved = self.resolve(path);
        Box::pin(async move {
            let full = resolved?;
            match tokio::fs::metadata(&full).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(io_err(e)),
            }
        })
    }

    fn delete_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<u64, BlobStoreError>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        Box::pin(async move {
            let removed = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
                let (dir_part, name_part) = FsBlobStore::split_prefix(&prefix);
                let base = if dir_part.is_empty() {
                    root.clone()
                } else {
                    root.join(dir_part)
                };
                if !base.exists() {
                    return Ok(0);
                }

                // Whole-directory prefixes drop the subtree in one call.
                if name_part.is_empty() {
                    let mut files = Vec::new();
                    collect_files(&base, &mut files)?;
                    std::fs::remove_dir_all(&base)?;
                    return Ok(files.len() as u64);
                }

                let mut files = Vec::new();
                collect_files(&base, &mut files)?;
                let mut removed = 0u64;
                for (file, _) in files {
                    let rel = file.strip_prefix(&root).unwrap_or(&file);
                    let rel_str = rel.to_string_lossy().replace('\\', "/");
                    if rel_str.starts_with(&prefix) {
                        std::fs::remove_file(&file)?;
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await
            .map_err(|e| BlobStoreError::Backend(e.to_string()))?
            .map_err(io_err)?;
            Ok(removed)
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<BlobStats, BlobStoreError>> {
        let root = self.root.clone();
        Box::pin(async move {
            let stats = tokio::task::spawn_blocking(move || -> std::io::Result<BlobStats> {
                if !root.exists() {
                    return Ok(BlobStats {
                        object_count: Some(0),
                        total_bytes: Some(0),
                    });
                }
                let mut files = Vec::new();
                collect_files(&root, &mut files)?;
                Ok(BlobStats {
                    object_count: Some(files.len() as u64),
                    total_bytes: Some(files.iter().map(|(_, size)| size).sum()),
                })
            })
            .await
            .map_err(|e| BlobStoreError::Backend(e.to_string()))?
            .map_err(io_err)?;
            Ok(stats)
        })
    }
}
