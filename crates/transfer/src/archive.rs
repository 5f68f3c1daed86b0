//! Directory-to-single-file packing (tar.gz).

use crate::error::{TransferError, TransferResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::Path;

/// Pack a directory into a gzip-compressed tar archive at `archive_path`.
///
/// `arcname` is the archive's internal root name; the default packs the
/// directory's contents at the archive root. Entries stream through the
/// encoder one file at a time, so directory size is unbounded.
pub async fn compress(
    archive_path: &Path,
    directory: &Path,
    arcname: Option<&str>,
) -> TransferResult<()> {
    let archive_path = archive_path.to_path_buf();
    let directory = directory.to_path_buf();
    let arcname = arcname.unwrap_or(".").to_string();

    run_blocking(move || {
        let file = File::create(&archive_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(&arcname, &directory)?;
        let encoder = builder
            .into_inner()
            .map_err(|e| TransferError::Archive(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| TransferError::Archive(e.to_string()))?;
        Ok(())
    })
    .await
}

/// Unpack a gzip-compressed tar archive into `directory`, creating it if
/// absent. The tar reader refuses entries that would land outside the
/// destination.
pub async fn extract(archive_path: &Path, directory: &Path) -> TransferResult<()> {
    let archive_path = archive_path.to_path_buf();
    let directory = directory.to_path_buf();

    run_blocking(move || {
        std::fs::create_dir_all(&directory)?;
        let file = File::open(&archive_path)?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive
            .unpack(&directory)
            .map_err(|e| TransferError::Archive(e.to_string()))?;
        Ok(())
    })
    .await
}

async fn run_blocking<F>(job: F) -> TransferResult<()>
where
    F: FnOnce() -> TransferResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| TransferError::Archive(format!("archive task failed: {e}")))?
}

/// Join the extension chain of a filename ("run.tar.gz" keeps "tar.gz").
pub(crate) fn suffix_chain(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let mut parts = name.split('.');
    parts.next()?;
    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        None
    } else {
        Some(rest.join("."))
    }
}
