//! Local filesystem backend (a directory shared between processes).

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, Metadata, RemoteFilesystem};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Shared-directory object store.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new local backend rooted at `root`, creating it if absent.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Validate a key and map it to a path under the root.
    ///
    /// Wraps `key_path_sync` in `spawn_blocking` because `canonicalize` and
    /// `symlink_metadata` hit the filesystem.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Synchronous key validation, including symlink-escape protection.
    ///
    /// Keys reach this backend already jail-normalized, but the backend
    /// still refuses traversal segments and symlinks that leave its root:
    /// a symlink placed inside the shared directory must not open a door
    /// out of it.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) => {}
                std::path::Component::CurDir => {}
                _ => {
                    return Err(StorageError::PathEscape(key.to_string()));
                }
            }
        }

        let path = root.join(key);

        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize storage root: {e}"),
            ))
        })?;

        // Existing paths (including broken symlinks): canonicalize and
        // verify the result stays inside the root.
        match std::fs::symlink_metadata(&path) {
            Ok(meta) => {
                let canonical = path.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::PathEscape(format!("dangling symlink: {key}"))
                    } else {
                        StorageError::Io(std::io::Error::new(
                            e.kind(),
                            format!("failed to canonicalize path: {e}"),
                        ))
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::PathEscape(key.to_string()));
                }
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }

        // New paths: walk up to the nearest existing ancestor and verify it
        // has not been symlinked out of the root, so writes through missing
        // intermediate directories cannot land outside.
        let mut ancestor = path.as_path();
        while let Some(parent) = ancestor.parent() {
            match std::fs::symlink_metadata(parent) {
                Ok(_) => {
                    let parent_canonical = parent.canonicalize().map_err(|e| {
                        StorageError::Io(std::io::Error::new(
                            e.kind(),
                            format!("failed to canonicalize ancestor: {e}"),
                        ))
                    })?;
                    if !parent_canonical.starts_with(&root_canonical) {
                        return Err(StorageError::PathEscape(key.to_string()));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
            ancestor = parent;
        }

        Ok(path)
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn map_not_found(err: std::io::Error, key: &str) -> StorageError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(err)
        }
    }

    /// Synthesize a revision token from size and mtime, so pointer records
    /// can short-circuit re-reads even though local disk has no native ETag.
    fn revision_token(meta: &std::fs::Metadata) -> Option<String> {
        let mtime = meta.modified().ok()?;
        let nanos = mtime.duration_since(UNIX_EPOCH).ok()?.as_nanos();
        Some(format!("{:x}-{:x}", meta.len(), nanos))
    }
}

#[async_trait]
impl RemoteFilesystem for LocalBackend {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn info(&self, path: &str) -> StorageResult<Metadata> {
        let full = self.key_path(path).await?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| Self::map_not_found(e, path))?;

        if meta.is_dir() {
            return Ok(Metadata {
                size: None,
                revision_token: None,
                is_directory: true,
            });
        }

        Ok(Metadata {
            size: Some(meta.len()),
            revision_token: Self::revision_token(&meta),
            is_directory: false,
        })
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn open(&self, path: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let full = self.key_path(path).await?;
        let file = fs::File::open(&full)
            .await
            .map_err(|e| Self::map_not_found(e, path))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield bytes::Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn get(&self, path: &str, local: &Path) -> StorageResult<()> {
        let full = self.key_path(path).await?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&full, local)
            .await
            .map_err(|e| Self::map_not_found(e, path))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn put(&self, local: &Path, path: &str) -> StorageResult<()> {
        let full = self.key_path(path).await?;
        Self::ensure_parent(&full).await?;

        // Copy to a uniquely named temp file next to the destination, then
        // rename: concurrent readers see the old version or the new one,
        // never a partial write.
        let temp_path = full.with_file_name(format!(
            "{}.tmp.{}",
            full.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Uuid::new_v4()
        ));
        let copied = fs::copy(local, &temp_path).await;
        if let Err(err) = copied {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = fs::rename(&temp_path, &full).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str, recursive: bool) -> StorageResult<()> {
        let full = self.key_path(path).await?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| Self::map_not_found(e, path))?;
        if meta.is_dir() {
            if !recursive {
                return Err(StorageError::InvalidPath(format!(
                    "refusing non-recursive delete of directory: {path}"
                )));
            }
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full)
                .await
                .map_err(|e| Self::map_not_found(e, path))?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        let full = self.key_path(path).await?;
        let mut entries = fs::read_dir(&full)
            .await
            .map_err(|e| Self::map_not_found(e, path))?;

        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                results.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        results.sort();
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn mkdirs(&self, path: &str) -> StorageResult<()> {
        let full = self.key_path(path).await?;
        fs::create_dir_all(&full).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let full = self.key_path(path).await?;
        fs::try_exists(&full).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn isfile(&self, path: &str) -> StorageResult<bool> {
        let full = self.key_path(path).await?;
        match fs::metadata(&full).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn isdir(&self, path: &str) -> StorageResult<bool> {
        let full = self.key_path(path).await?;
        match fs::metadata(&full).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
