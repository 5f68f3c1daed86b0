//! Driver/worker file store: transfer operations over the jail and cache.

use crate::archive;
use crate::cache::{is_url, ContentCache};
use crate::error::{TransferError, TransferResult};
use ferry_core::{StorageSettings, ARCHIVE_FILE_SUFFIX, LOG_FILE_SUFFIX};
use ferry_storage::{ByteStream, RemoteFilesystem, RootJail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

/// Storage facade shared between a driver and its workers.
///
/// All references are confined to the configured root; single-object reads
/// go through the content cache so unchanged objects are fetched once.
pub struct FileStore {
    jail: RootJail,
    cache: ContentCache,
}

impl FileStore {
    /// Build a store over a backend, rooted at `root_dir`, with an optional
    /// shared cache directory.
    pub fn new(
        fs: Arc<dyn RemoteFilesystem>,
        root_dir: &str,
        cache_dir: Option<PathBuf>,
    ) -> TransferResult<Self> {
        let jail = RootJail::new(fs, root_dir)
            .map_err(|e| TransferError::Config(e.to_string()))?;
        let cache = ContentCache::new(jail.clone(), cache_dir);
        Ok(Self { jail, cache })
    }

    /// Build a store from a serializable settings descriptor.
    pub async fn from_settings(settings: &StorageSettings) -> TransferResult<Self> {
        let fs = ferry_storage::from_config(&settings.storage)
            .await
            .map_err(|e| TransferError::Config(e.to_string()))?;
        Self::new(fs, &settings.root_dir, settings.cache_dir.clone())
    }

    /// The content cache resolver.
    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Retrieve a stored object into `output_path` (joined with `subdir`).
    ///
    /// When the target is an existing directory the filename is derived
    /// from the reference. The cache entry is copied, never handed out
    /// directly, so the shared cache stays untouched by the caller.
    pub async fn get(
        &self,
        reference: &str,
        output_path: &Path,
        subdir: &str,
        required: bool,
    ) -> TransferResult<Option<PathBuf>> {
        if reference.is_empty() {
            if required {
                return Err(TransferError::MissingReference(reference.to_string()));
            }
            return Ok(None);
        }

        let mut target = if subdir.is_empty() {
            output_path.to_path_buf()
        } else {
            output_path.join(subdir)
        };

        if target.is_dir() {
            let name = reference_basename(reference);
            target = target.join(name);
        }

        let resolved = match self
            .cache
            .resolve(reference, required, Some(target.as_path()))
            .await?
        {
            Some(path) => path,
            None => return Ok(None),
        };

        if resolved != target {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&resolved, &target).await?;
        }

        Ok(Some(target))
    }

    /// Place a local file or directory in storage.
    ///
    /// Files are stored verbatim; directories are packed into a tar.gz
    /// archive first (streamed through a scratch file, never buffered
    /// whole). Returns the storage reference, or `None` when `source`
    /// names neither a file nor a directory.
    pub async fn put(
        &self,
        source: &Path,
        filename: Option<&str>,
        subdir: &str,
        suffix: Option<&str>,
        arcname: Option<&str>,
    ) -> TransferResult<Option<String>> {
        let meta = match tokio::fs::metadata(source).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if meta.is_file() {
            let ext = match suffix {
                Some(suffix) => Some(suffix.to_string()),
                None => archive::suffix_chain(source),
            };
            let storage_path = storage_location(filename, subdir, ext.as_deref());
            self.ensure_storage_parent(&storage_path).await?;

            info!(source = %source.display(), reference = %storage_path, "store file");
            self.jail
                .put(source, &storage_path)
                .await
                .map_err(|e| TransferError::from_storage(&storage_path, e))?;
            return Ok(Some(storage_path));
        }

        if meta.is_dir() {
            let ext = suffix.unwrap_or(ARCHIVE_FILE_SUFFIX);
            let storage_path = storage_location(filename, subdir, Some(ext));
            self.ensure_storage_parent(&storage_path).await?;

            let scratch = tempfile::tempdir()?;
            let archive_path = scratch.path().join("archive");
            archive::compress(&archive_path, source, arcname).await?;

            info!(source = %source.display(), reference = %storage_path, "store dir");
            self.jail
                .put(&archive_path, &storage_path)
                .await
                .map_err(|e| TransferError::from_storage(&storage_path, e))?;
            return Ok(Some(storage_path));
        }

        Ok(None)
    }

    /// Fetch an archive reference and unpack it into `directory`, creating
    /// the directory if absent.
    pub async fn extract(
        &self,
        archive_reference: &str,
        directory: &Path,
        subdir: &str,
    ) -> TransferResult<()> {
        let scratch = tempfile::tempdir()?;
        let target = scratch.path().join(reference_basename(archive_reference));

        let local = self
            .get(archive_reference, &target, subdir, true)
            .await?
            .ok_or_else(|| TransferError::MissingReference(archive_reference.to_string()))?;

        archive::extract(&local, directory).await
    }

    /// Pack a directory into a tar.gz archive at a local path.
    pub async fn compress(
        &self,
        archive_path: &Path,
        directory: &Path,
        arcname: Option<&str>,
    ) -> TransferResult<()> {
        archive::compress(archive_path, directory, arcname).await
    }

    /// Delete a single stored file. Logs and no-ops when the reference is
    /// not a confirmed file (including out-of-root references).
    pub async fn delete_file(&self, reference: &str) -> TransferResult<()> {
        if self
            .jail
            .isfile(reference)
            .await
            .map_err(|e| TransferError::from_storage(reference, e))?
        {
            self.jail
                .delete(reference, false)
                .await
                .map_err(|e| TransferError::from_storage(reference, e))?;
            info!(reference = %reference, "deleted shared file");
        } else {
            info!(reference = %reference, "delete skipped, reference is not a stored file");
        }
        Ok(())
    }

    /// Delete a stored directory tree. Refuses the storage root itself and
    /// logs and no-ops on anything that is not a confirmed directory.
    pub async fn delete_dir(&self, reference: &str) -> TransferResult<()> {
        if self
            .jail
            .isdir(reference)
            .await
            .map_err(|e| TransferError::from_storage(reference, e))?
        {
            if self.jail.is_root(reference) {
                info!(reference = %reference, "delete skipped, refusing to remove the storage root");
            } else {
                self.jail
                    .delete(reference, true)
                    .await
                    .map_err(|e| TransferError::from_storage(reference, e))?;
                info!(reference = %reference, "deleted shared dir");
            }
        } else {
            info!(reference = %reference, "delete skipped, reference is not a stored dir");
        }
        Ok(())
    }

    /// Store captured process output as a log object, returning its
    /// reference.
    pub async fn create_traceback(
        &self,
        stdout: &str,
        stderr: &str,
    ) -> TransferResult<Option<String>> {
        let scratch = tempfile::tempdir()?;
        let log_path = scratch.path().join("traceback");
        let mut file = tokio::fs::File::create(&log_path).await?;
        if !stdout.is_empty() {
            file.write_all(stdout.as_bytes()).await?;
        }
        if !stderr.is_empty() {
            file.write_all(stderr.as_bytes()).await?;
        }
        file.flush().await?;
        drop(file);

        self.put(&log_path, None, "", Some(LOG_FILE_SUFFIX), None)
            .await
    }

    /// Existence probe for a jailed reference.
    pub async fn exists(&self, reference: &str) -> TransferResult<bool> {
        self.jail
            .exists(reference)
            .await
            .map_err(|e| TransferError::from_storage(reference, e))
    }

    /// File probe for a jailed reference.
    pub async fn isfile(&self, reference: &str) -> TransferResult<bool> {
        self.jail
            .isfile(reference)
            .await
            .map_err(|e| TransferError::from_storage(reference, e))
    }

    /// Directory probe for a jailed reference.
    pub async fn isdir(&self, reference: &str) -> TransferResult<bool> {
        self.jail
            .isdir(reference)
            .await
            .map_err(|e| TransferError::from_storage(reference, e))
    }

    /// List entries under a jailed reference.
    pub async fn listdir(&self, reference: &str) -> TransferResult<Vec<String>> {
        self.jail
            .list(reference)
            .await
            .map_err(|e| TransferError::from_storage(reference, e))
    }

    /// Open a stored object as a byte stream.
    pub async fn open(&self, reference: &str) -> TransferResult<ByteStream> {
        self.jail
            .open(reference)
            .await
            .map_err(|e| TransferError::from_storage(reference, e))
    }

    async fn ensure_storage_parent(&self, storage_path: &str) -> TransferResult<()> {
        if let Some((parent, _)) = storage_path.rsplit_once('/') {
            self.jail
                .mkdirs(parent)
                .await
                .map_err(|e| TransferError::from_storage(storage_path, e))?;
        }
        Ok(())
    }
}

/// Storage key for a new object: caller-supplied or generated name, under
/// an optional subdirectory.
fn storage_location(filename: Option<&str>, subdir: &str, suffix: Option<&str>) -> String {
    let name = match filename {
        Some(name) => name.to_string(),
        None => unique_filename(suffix),
    };
    if subdir.is_empty() {
        name
    } else {
        format!("{}/{}", subdir.trim_end_matches('/'), name)
    }
}

/// Generated object name: a uuid hex string plus the filename extension.
fn unique_filename(suffix: Option<&str>) -> String {
    let base = Uuid::new_v4().simple().to_string();
    match suffix {
        Some(suffix) => format!("{}.{}", base, suffix.trim_start_matches('.')),
        None => base,
    }
}

/// Basename for a fetched reference: the URL path basename for URLs, the
/// final path component otherwise.
fn reference_basename(reference: &str) -> String {
    if is_url(reference) {
        if let Ok(url) = reqwest::Url::parse(reference) {
            if let Some(name) = url.path_segments().and_then(|mut s| s.next_back()) {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
        return "download".to_string();
    }
    Path::new(reference)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| reference.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_filename_suffix() {
        let name = unique_filename(Some("tar.gz"));
        assert!(name.ends_with(".tar.gz"));
        let name = unique_filename(Some(".txt"));
        assert!(name.ends_with(".txt"));
        assert!(!name.contains(".."));
        let name = unique_filename(None);
        assert!(!name.contains('.'));
    }

    #[test]
    fn test_storage_location_joins_subdir() {
        assert_eq!(
            storage_location(Some("out.txt"), "runs/7", None),
            "runs/7/out.txt"
        );
        assert_eq!(storage_location(Some("out.txt"), "", None), "out.txt");
    }

    #[test]
    fn test_reference_basename() {
        assert_eq!(reference_basename("a/b/c.txt"), "c.txt");
        assert_eq!(reference_basename("c.txt"), "c.txt");
        assert_eq!(
            reference_basename("https://example.com/files/data.bin?sig=x"),
            "data.bin"
        );
    }
}
