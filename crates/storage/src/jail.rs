//! Root-jailed filesystem wrapper.
//!
//! Every path is resolved against a fixed root before it reaches the
//! underlying backend. Resolution collapses `.` and `..` lexically and
//! rejects any result that is not a path-component descendant of the root,
//! so attacker-controlled reference strings cannot read or write outside
//! the configured subtree.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, Metadata, RemoteFilesystem};
use std::path::Path;
use std::sync::Arc;

/// A [`RemoteFilesystem`] confined to a root key prefix.
#[derive(Clone)]
pub struct RootJail {
    fs: Arc<dyn RemoteFilesystem>,
    root: String,
}

impl RootJail {
    /// Create a jail rooted at `root` (a `/`-separated key, possibly empty).
    ///
    /// Fails if the root itself contains traversal segments that escape.
    pub fn new(fs: Arc<dyn RemoteFilesystem>, root: &str) -> StorageResult<Self> {
        let root = normalize(root)
            .ok_or_else(|| StorageError::InvalidPath(format!("invalid jail root: {root}")))?;
        Ok(Self { fs, root })
    }

    /// The normalized jail root.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<dyn RemoteFilesystem> {
        &self.fs
    }

    /// Resolve a reference against the root.
    ///
    /// Absolute references are re-rooted at the jail root rather than at the
    /// backend root. The containment check is per path component: a sibling
    /// sharing a string prefix with the root (`data` vs `data-other`) does
    /// not pass.
    pub fn resolve(&self, path: &str) -> StorageResult<String> {
        let joined = if self.root.is_empty() {
            path.trim_start_matches('/').to_string()
        } else {
            format!("{}/{}", self.root, path.trim_start_matches('/'))
        };

        let resolved = normalize(&joined)
            .ok_or_else(|| StorageError::PathEscape(path.to_string()))?;

        let contained = self.root.is_empty()
            || resolved == self.root
            || resolved.starts_with(&format!("{}/", self.root));
        if !contained {
            return Err(StorageError::PathEscape(path.to_string()));
        }

        Ok(resolved)
    }

    /// Whether a reference resolves to the jail root itself.
    pub fn is_root(&self, path: &str) -> bool {
        matches!(self.resolve(path), Ok(resolved) if resolved == self.root)
    }

    /// Existence probe. Escapes and not-found conditions are `false`, not
    /// errors; genuine backend failures still propagate.
    pub async fn exists(&self, path: &str) -> StorageResult<bool> {
        match self.resolve(path) {
            Ok(resolved) => soften(self.fs.exists(&resolved).await),
            Err(StorageError::PathEscape(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// File probe, with the same softening as [`RootJail::exists`].
    pub async fn isfile(&self, path: &str) -> StorageResult<bool> {
        match self.resolve(path) {
            Ok(resolved) => soften(self.fs.isfile(&resolved).await),
            Err(StorageError::PathEscape(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Directory probe, with the same softening as [`RootJail::exists`].
    pub async fn isdir(&self, path: &str) -> StorageResult<bool> {
        match self.resolve(path) {
            Ok(resolved) => soften(self.fs.isdir(&resolved).await),
            Err(StorageError::PathEscape(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Metadata lookup. Escapes propagate: this is an access request.
    pub async fn info(&self, path: &str) -> StorageResult<Metadata> {
        let resolved = self.resolve(path)?;
        self.fs.info(&resolved).await
    }

    /// Open a jailed path as a byte stream.
    pub async fn open(&self, path: &str) -> StorageResult<ByteStream> {
        let resolved = self.resolve(path)?;
        self.fs.open(&resolved).await
    }

    /// Fetch a jailed path into a local file.
    pub async fn get(&self, path: &str, local: &Path) -> StorageResult<()> {
        let resolved = self.resolve(path)?;
        self.fs.get(&resolved, local).await
    }

    /// Upload a local file to a jailed path.
    pub async fn put(&self, local: &Path, path: &str) -> StorageResult<()> {
        let resolved = self.resolve(path)?;
        self.fs.put(local, &resolved).await
    }

    /// Delete a jailed path.
    pub async fn delete(&self, path: &str, recursive: bool) -> StorageResult<()> {
        let resolved = self.resolve(path)?;
        self.fs.delete(&resolved, recursive).await
    }

    /// List entries under a jailed path, as jail-relative keys.
    pub async fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        let resolved = self.resolve(path)?;
        let entries = self.fs.list(&resolved).await?;
        if self.root.is_empty() {
            return Ok(entries);
        }
        let prefix = format!("{}/", self.root);
        Ok(entries
            .iter()
            .map(|entry| entry.strip_prefix(&prefix).unwrap_or(entry).to_string())
            .collect())
    }

    /// Create a jailed directory path.
    pub async fn mkdirs(&self, path: &str) -> StorageResult<()> {
        let resolved = self.resolve(path)?;
        self.fs.mkdirs(&resolved).await
    }
}

/// Not-found and escape conditions become `false` for existence probes.
fn soften(result: StorageResult<bool>) -> StorageResult<bool> {
    match result {
        Ok(found) => Ok(found),
        Err(err) if err.is_not_found() => Ok(false),
        Err(StorageError::PathEscape(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Collapse `.` and `..` segments of a `/`-separated key.
///
/// Returns `None` when `..` would pop above the start of the key.
fn normalize(key: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in key.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::local::LocalBackend;

    async fn jail_over(root: &str) -> (tempfile::TempDir, RootJail) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).await.unwrap();
        let jail = RootJail::new(Arc::new(backend), root).unwrap();
        (dir, jail)
    }

    #[tokio::test]
    async fn test_resolve_plain_reference() {
        let (_dir, jail) = jail_over("r").await;
        assert_eq!(jail.resolve("a.txt").unwrap(), "r/a.txt");
        assert_eq!(jail.resolve("sub/b.txt").unwrap(), "r/sub/b.txt");
    }

    #[tokio::test]
    async fn test_resolve_collapses_dot_segments() {
        let (_dir, jail) = jail_over("r").await;
        assert_eq!(jail.resolve("./a/../b.txt").unwrap(), "r/b.txt");
    }

    #[tokio::test]
    async fn test_resolve_rejects_escape() {
        let (_dir, jail) = jail_over("r").await;
        let err = jail.resolve("../outside/x").unwrap_err();
        assert!(matches!(err, StorageError::PathEscape(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_resolve_rejects_deep_escape() {
        let (_dir, jail) = jail_over("r").await;
        assert!(jail.resolve("a/../../etc/passwd").is_err());
        assert!(jail.resolve("../../../../tmp/x").is_err());
    }

    #[tokio::test]
    async fn test_sibling_prefix_is_not_containment() {
        let (_dir, jail) = jail_over("data").await;
        // "data-other" shares a string prefix with the root but is a sibling.
        assert!(jail.resolve("../data-other/x").is_err());
    }

    #[tokio::test]
    async fn test_absolute_reference_rerooted() {
        let (_dir, jail) = jail_over("r").await;
        assert_eq!(jail.resolve("/a.txt").unwrap(), "r/a.txt");
    }

    #[tokio::test]
    async fn test_empty_root_allows_all_relative() {
        let (_dir, jail) = jail_over("").await;
        assert_eq!(jail.resolve("a/b").unwrap(), "a/b");
        assert!(jail.resolve("../x").is_err());
    }

    #[tokio::test]
    async fn test_is_root() {
        let (_dir, jail) = jail_over("r").await;
        assert!(jail.is_root(""));
        assert!(jail.is_root("."));
        assert!(jail.is_root("sub/.."));
        assert!(!jail.is_root("sub"));
    }

    #[tokio::test]
    async fn test_probes_return_false_on_escape() {
        let (_dir, jail) = jail_over("r").await;
        assert!(!jail.exists("../outside").await.unwrap());
        assert!(!jail.isfile("../outside").await.unwrap());
        assert!(!jail.isdir("../outside").await.unwrap());
    }

    #[tokio::test]
    async fn test_probes_return_false_on_missing() {
        let (_dir, jail) = jail_over("r").await;
        assert!(!jail.exists("nope.txt").await.unwrap());
        assert!(!jail.isfile("nope.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_mutating_operations_propagate_escape() {
        let (_dir, jail) = jail_over("r").await;
        let err = jail.info("../outside").await.unwrap_err();
        assert!(matches!(err, StorageError::PathEscape(_)));
        let err = jail.delete("../outside", false).await.unwrap_err();
        assert!(matches!(err, StorageError::PathEscape(_)));
    }
}
