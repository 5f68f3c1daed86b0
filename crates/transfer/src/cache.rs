//! Content-addressed cache with change-token invalidation.
//!
//! The cache maps a reference to a local file holding its current content
//! through a two-level index: a pointer record named by the hash of the
//! reference string, and a content blob named by the hash of the bytes.
//! When a backend's revision token matches the pointer record, the blob is
//! served with zero bytes transferred; when it differs, the object is
//! re-streamed, hashed in the same pass, and published with an atomic
//! rename so concurrent readers never observe partial state.

use crate::error::{TransferError, TransferResult};
use bytes::Bytes;
use ferry_core::hash::ContentHash;
use ferry_core::POINTER_SUFFIX;
use ferry_storage::{Metadata, RootJail, StorageError};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// On-disk pointer record: last-known revision token and the blob holding
/// the content fetched under that token.
#[derive(Debug, Serialize, Deserialize)]
struct PointerRecord {
    revision_token: Option<String>,
    content_path: String,
}

/// Byte stream with transfer-level errors attached.
type TransferStream = Pin<Box<dyn Stream<Item = TransferResult<Bytes>> + Send>>;

/// Reference-to-local-path resolver over a jailed remote filesystem.
pub struct ContentCache {
    jail: RootJail,
    cache_dir: Option<PathBuf>,
    http: reqwest::Client,
}

impl ContentCache {
    /// Create a cache over a jailed filesystem. `cache_dir: None` disables
    /// caching entirely; every resolve then needs a fallback target.
    pub fn new(jail: RootJail, cache_dir: Option<PathBuf>) -> Self {
        Self {
            jail,
            cache_dir,
            http: reqwest::Client::new(),
        }
    }

    /// Whether a cache directory is configured.
    pub fn is_enabled(&self) -> bool {
        self.cache_dir.is_some()
    }

    /// Resolve a reference to a local path holding its current content.
    ///
    /// Returns `None` when the reference is empty or names a missing object
    /// and `required` is false. With caching enabled the returned path is a
    /// shared cache entry and must not be mutated by the caller.
    pub async fn resolve(
        &self,
        reference: &str,
        required: bool,
        fallback_target: Option<&Path>,
    ) -> TransferResult<Option<PathBuf>> {
        if reference.is_empty() {
            if required {
                return Err(TransferError::MissingReference(reference.to_string()));
            }
            return Ok(None);
        }

        let Some(cache_dir) = &self.cache_dir else {
            return self.resolve_uncached(reference, required, fallback_target).await;
        };
        tokio::fs::create_dir_all(cache_dir).await?;

        let meta = match self.lookup_metadata(reference).await? {
            Some(meta) => meta,
            None => {
                if required {
                    return Err(TransferError::MissingReference(reference.to_string()));
                }
                return Ok(None);
            }
        };

        if meta.is_directory {
            return Err(TransferError::NotAFile(reference.to_string()));
        }

        let Some(token) = meta.revision_token else {
            // A backend that normally supplies a token returned none for
            // this call. Its content cannot be trusted as unchanged, so
            // skip the cache for this one fetch rather than risk serving
            // stale bytes under a false hit.
            warn!(
                reference = %reference,
                "revision token missing; bypassing cache and returning a fresh download"
            );
            let mut temp = TempFile::create_in(&std::env::temp_dir(), "ferry-").await?;
            let mut stream = self.open_reference(reference).await?;
            while let Some(chunk) = stream.next().await {
                temp.write(&chunk?).await?;
            }
            return Ok(Some(temp.into_path()));
        };

        let pointer_path =
            cache_dir.join(format!("{}.{}", hash_reference(reference), POINTER_SUFFIX));

        if let Some(record) = read_pointer(&pointer_path).await {
            if record.revision_token.as_deref() == Some(token.as_str()) {
                let blob_path = cache_dir.join(&record.content_path);
                if tokio::fs::try_exists(&blob_path).await.unwrap_or(false) {
                    return Ok(Some(blob_path));
                }
            }
        }

        // Miss or token change: stream the object once, hashing while
        // spooling to a private temp file in the cache directory.
        let stream = self.open_reference(reference).await?;
        let (content_hash, temp) = spool(cache_dir, stream).await?;

        let content_name = content_hash.to_hex();
        let blob_path = cache_dir.join(&content_name);
        if tokio::fs::try_exists(&blob_path).await.unwrap_or(false) {
            // Identical content already cached under another reference or a
            // previous version of this one.
            temp.discard().await;
        } else {
            temp.promote(&blob_path).await?;
        }

        write_pointer(
            cache_dir,
            &pointer_path,
            &PointerRecord {
                revision_token: Some(token),
                content_path: content_name,
            },
        )
        .await?;

        info!(reference = %reference, blob = %blob_path.display(), "cached");
        Ok(Some(blob_path))
    }

    /// Direct fetch when no cache directory is configured.
    async fn resolve_uncached(
        &self,
        reference: &str,
        required: bool,
        fallback_target: Option<&Path>,
    ) -> TransferResult<Option<PathBuf>> {
        let Some(target) = fallback_target else {
            return Err(TransferError::Config(
                "fallback target not set while the cache is disabled".to_string(),
            ));
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut stream = match self.open_reference(reference).await {
            Ok(stream) => stream,
            Err(err) if is_not_found(&err) => {
                if required {
                    return Err(TransferError::MissingReference(reference.to_string()));
                }
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let mut file = tokio::fs::File::create(target).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        info!(reference = %reference, target = %target.display(), "fetched without cache");
        Ok(Some(target.to_path_buf()))
    }

    /// Per-call metadata for a reference. `None` means the object does not
    /// exist; URLs are probed with an HTTP HEAD and use the ETag header as
    /// their revision token.
    async fn lookup_metadata(&self, reference: &str) -> TransferResult<Option<Metadata>> {
        if is_url(reference) {
            let response = self
                .http
                .head(reference)
                .send()
                .await
                .map_err(|e| http_error(reference, e))?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let response = response
                .error_for_status()
                .map_err(|e| http_error(reference, e))?;

            let revision_token = response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(normalize_etag);
            return Ok(Some(Metadata {
                size: response.content_length(),
                revision_token,
                is_directory: false,
            }));
        }

        match self.jail.info(reference).await {
            Ok(meta) => Ok(Some(meta)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(TransferError::from_storage(reference, err)),
        }
    }

    /// Open a reference as a byte stream, via anonymous HTTP GET for URLs
    /// and through the jail otherwise. Missing objects surface as a
    /// not-found-shaped transfer error.
    async fn open_reference(&self, reference: &str) -> TransferResult<TransferStream> {
        if is_url(reference) {
            let response = self
                .http
                .get(reference)
                .send()
                .await
                .map_err(|e| http_error(reference, e))?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(TransferError::Transfer {
                    reference: reference.to_string(),
                    source: StorageError::NotFound(reference.to_string()),
                });
            }
            let response = response
                .error_for_status()
                .map_err(|e| http_error(reference, e))?;

            let reference = reference.to_string();
            return Ok(Box::pin(response.bytes_stream().map(move |result| {
                result.map_err(|e| http_error(&reference, e))
            })));
        }

        let stream = self
            .jail
            .open(reference)
            .await
            .map_err(|e| TransferError::from_storage(reference, e))?;
        let reference = reference.to_string();
        Ok(Box::pin(stream.map(move |result| {
            result.map_err(|e| TransferError::from_storage(&reference, e))
        })))
    }
}

/// Stable pointer key for a reference string.
fn hash_reference(reference: &str) -> String {
    ContentHash::compute(reference.as_bytes()).to_hex()
}

/// Whether a reference is a well-formed http(s) URL.
pub(crate) fn is_url(reference: &str) -> bool {
    match reqwest::Url::parse(reference) {
        Ok(url) => {
            matches!(url.scheme(), "http" | "https") && url.has_host()
        }
        Err(_) => false,
    }
}

fn normalize_etag(raw: &str) -> String {
    raw.trim_start_matches("W/").trim_matches('"').to_string()
}

fn http_error(reference: &str, source: reqwest::Error) -> TransferError {
    TransferError::Http {
        reference: reference.to_string(),
        source,
    }
}

fn is_not_found(err: &TransferError) -> bool {
    matches!(
        err,
        TransferError::Transfer {
            source: StorageError::NotFound(_),
            ..
        }
    )
}

async fn read_pointer(pointer_path: &Path) -> Option<PointerRecord> {
    let raw = tokio::fs::read(pointer_path).await.ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Publish a pointer record with the same temp-then-rename pattern as
/// blobs, so readers see the previous record or the new one, never a mix.
async fn write_pointer(
    cache_dir: &Path,
    pointer_path: &Path,
    record: &PointerRecord,
) -> TransferResult<()> {
    let raw = serde_json::to_vec(record)
        .map_err(|e| TransferError::Config(format!("pointer record encoding failed: {e}")))?;
    let mut temp = TempFile::create_in(cache_dir, ".tmp.").await?;
    temp.write(&raw).await?;
    temp.promote(pointer_path).await?;
    Ok(())
}

/// Stream into a temp file, computing the content hash in the same pass.
async fn spool<S>(dir: &Path, mut stream: S) -> TransferResult<(ContentHash, TempFile)>
where
    S: Stream<Item = TransferResult<Bytes>> + Unpin,
{
    let mut temp = TempFile::create_in(dir, ".tmp.").await?;
    let mut hasher = ContentHash::hasher();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        temp.write(&chunk).await?;
    }
    Ok((hasher.finalize(), temp))
}

/// A uniquely named temp file that removes itself unless promoted.
struct TempFile {
    file: tokio::fs::File,
    path: PathBuf,
    published: bool,
}

impl TempFile {
    async fn create_in(dir: &Path, prefix: &str) -> std::io::Result<Self> {
        let path = dir.join(format!("{prefix}{}", Uuid::new_v4()));
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            file,
            path,
            published: false,
        })
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data).await
    }

    /// Atomically move into place. Readers never see a partial file at the
    /// destination; overwriting a racing writer's identical blob is safe.
    async fn promote(mut self, dest: &Path) -> std::io::Result<()> {
        self.file.sync_all().await?;
        tokio::fs::rename(&self.path, dest).await?;
        self.published = true;
        Ok(())
    }

    /// Remove the temp file (content already cached elsewhere).
    async fn discard(mut self) {
        self.published = true;
        let _ = tokio::fs::remove_file(&self.path).await;
    }

    /// Keep the file and hand ownership of the path to the caller.
    fn into_path(mut self) -> PathBuf {
        self.published = true;
        self.path.clone()
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.published {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("http://example.com/data.bin"));
        assert!(is_url("https://example.com/a/b.txt"));
        assert!(!is_url("plain/path/file.txt"));
        assert!(!is_url("ftp://example.com/x"));
        assert!(!is_url(""));
    }

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("\"abc123\""), "abc123");
        assert_eq!(normalize_etag("W/\"abc123\""), "abc123");
        assert_eq!(normalize_etag("abc123"), "abc123");
    }

    #[test]
    fn test_hash_reference_is_stable() {
        assert_eq!(hash_reference("a/b.txt"), hash_reference("a/b.txt"));
        assert_ne!(hash_reference("a/b.txt"), hash_reference("a/c.txt"));
    }
}
