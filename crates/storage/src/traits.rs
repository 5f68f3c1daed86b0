//! Remote filesystem trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::path::Path;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Metadata about one stored object.
///
/// Produced fresh on every `info` call and never cached beyond the current
/// lookup: the revision token is only trustworthy at the moment it was read.
#[derive(Clone, Debug)]
pub struct Metadata {
    /// Object size in bytes, if the backend reports one.
    pub size: Option<u64>,
    /// Value that changes whenever the object's content may have changed
    /// (ETag for object stores, synthesized from size+mtime for local disk).
    /// `None` means the backend failed to supply one for this call.
    pub revision_token: Option<String>,
    /// Whether the path names a directory (or directory-like prefix).
    pub is_directory: bool,
}

/// Capability object over one remote or shared object store.
///
/// Paths are `/`-separated keys relative to the backend root. Backends:
/// local disk, S3-compatible object storage, Azure blob storage.
#[async_trait]
pub trait RemoteFilesystem: Send + Sync + 'static {
    /// Look up metadata for a path without fetching content.
    async fn info(&self, path: &str) -> StorageResult<Metadata>;

    /// Open a path as a byte stream (chunked, bounded memory).
    async fn open(&self, path: &str) -> StorageResult<ByteStream>;

    /// Fetch a remote object into a local file.
    async fn get(&self, path: &str, local: &Path) -> StorageResult<()>;

    /// Upload a local file to a remote path.
    async fn put(&self, local: &Path, path: &str) -> StorageResult<()>;

    /// Delete a path. `recursive` deletes a directory and its contents.
    async fn delete(&self, path: &str, recursive: bool) -> StorageResult<()>;

    /// List the entries directly under a path.
    async fn list(&self, path: &str) -> StorageResult<Vec<String>>;

    /// Create a directory and any missing parents. A no-op on backends
    /// without real directories.
    async fn mkdirs(&self, path: &str) -> StorageResult<()>;

    /// Check if a path exists.
    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Check if a path names a file.
    async fn isfile(&self, path: &str) -> StorageResult<bool>;

    /// Check if a path names a directory.
    async fn isdir(&self, path: &str) -> StorageResult<bool>;

    /// Static identifier for the backend type, used in logging.
    fn backend_name(&self) -> &'static str;
}
