//! Azure blob storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, Metadata, RemoteFilesystem};
use async_trait::async_trait;
use azure_core::error::ErrorKind;
use azure_storage::{CloudLocation, StorageCredentials};
use azure_storage_blobs::blob::{BlobBlockType, BlockList};
use azure_storage_blobs::prelude::*;
use bytes::Bytes;
use futures::StreamExt;
use std::path::Path;
use tracing::instrument;

/// Block size for staged uploads (8 MiB).
const UPLOAD_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Azure blob container object store.
pub struct AzureBackend {
    container: ContainerClient,
    prefix: Option<String>,
}

impl std::fmt::Debug for AzureBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureBackend")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl AzureBackend {
    /// Create a new Azure backend for one blob container.
    ///
    /// Without an access key the client runs anonymously (public
    /// containers). `endpoint` points at Azurite or a sovereign cloud.
    pub fn new(
        account: &str,
        container: &str,
        access_key: Option<String>,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> StorageResult<Self> {
        if account.is_empty() || container.is_empty() {
            return Err(StorageError::Config(
                "azure config requires a non-empty account and container".to_string(),
            ));
        }

        let credentials = match access_key {
            Some(key) => StorageCredentials::access_key(account.to_string(), key),
            None => StorageCredentials::anonymous(),
        };

        let builder = match endpoint {
            Some(uri) => ClientBuilder::with_location(
                CloudLocation::Custom {
                    account: account.to_string(),
                    uri,
                },
                credentials,
            ),
            None => ClientBuilder::new(account.to_string(), credentials),
        };

        let normalized_prefix = prefix.map(|p| p.trim_end_matches('/').to_string());

        Ok(Self {
            container: builder.container_client(container.to_string()),
            prefix: normalized_prefix,
        })
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }

    fn strip_prefix(&self, full_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => {
                let prefix_with_slash = format!("{}/", prefix);
                full_key
                    .strip_prefix(&prefix_with_slash)
                    .unwrap_or(full_key)
                    .to_string()
            }
            None => full_key.to_string(),
        }
    }

    fn map_azure_error(err: azure_core::error::Error, path: &str) -> StorageError {
        if let ErrorKind::HttpResponse { status, .. } = err.kind() {
            if *status == azure_core::StatusCode::NotFound {
                return StorageError::NotFound(path.to_string());
            }
        }
        StorageError::Backend(Box::new(err))
    }

    /// Whether any blob exists under `key/`.
    async fn has_children(&self, key: &str) -> StorageResult<bool> {
        let dir_prefix = format!("{}/", self.full_key(key).trim_end_matches('/'));
        let mut pages = self
            .container
            .list_blobs()
            .prefix(dir_prefix)
            .into_stream();
        if let Some(page) = pages.next().await {
            let page = page.map_err(|e| Self::map_azure_error(e, key))?;
            return Ok(page.blobs.blobs().next().is_some());
        }
        Ok(false)
    }
}

#[async_trait]
impl RemoteFilesystem for AzureBackend {
    #[instrument(skip(self), fields(backend = "azure"))]
    async fn info(&self, path: &str) -> StorageResult<Metadata> {
        let blob = self.container.blob_client(self.full_key(path));
        match blob.get_properties().await {
            Ok(response) => Ok(Metadata {
                size: Some(response.blob.properties.content_length),
                revision_token: Some(response.blob.properties.etag.to_string()),
                is_directory: false,
            }),
            Err(err) => {
                let mapped = Self::map_azure_error(err, path);
                if mapped.is_not_found() && self.has_children(path).await? {
                    return Ok(Metadata {
                        size: None,
                        revision_token: None,
                        is_directory: true,
                    });
                }
                Err(mapped)
            }
        }
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn open(&self, path: &str) -> StorageResult<ByteStream> {
        let blob = self.container.blob_client(self.full_key(path));
        let reference = path.to_string();

        let stream = async_stream::try_stream! {
            let mut chunks = blob.get().into_stream();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(|e| Self::map_azure_error(e, &reference))?;
                let mut body = chunk.data;
                while let Some(data) = body.next().await {
                    let data = data.map_err(|e| Self::map_azure_error(e, &reference))?;
                    yield data;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn get(&self, path: &str, local: &Path) -> StorageResult<()> {
        use tokio::io::AsyncWriteExt;

        let mut stream = self.open(path).await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(local).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn put(&self, local: &Path, path: &str) -> StorageResult<()> {
        use tokio::io::AsyncReadExt;

        let blob = self.container.blob_client(self.full_key(path));
        let mut file = tokio::fs::File::open(local).await?;
        let mut blocks = BlockList::default();
        let mut buf = vec![0u8; UPLOAD_BLOCK_SIZE];
        let mut index = 0u32;

        // Stage fixed-size blocks, then commit the list, so arbitrarily
        // large files upload without buffering more than one block.
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }

            let block_id = format!("{index:08x}");
            blob.put_block(block_id.clone(), Bytes::copy_from_slice(&buf[..filled]))
                .await
                .map_err(|e| Self::map_azure_error(e, path))?;
            blocks
                .blocks
                .push(BlobBlockType::new_uncommitted(block_id));
            index += 1;
        }

        if blocks.blocks.is_empty() {
            blob.put_block_blob(Bytes::new())
                .await
                .map_err(|e| Self::map_azure_error(e, path))?;
        } else {
            blob.put_block_list(blocks)
                .await
                .map_err(|e| Self::map_azure_error(e, path))?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn delete(&self, path: &str, recursive: bool) -> StorageResult<()> {
        if recursive && self.isdir(path).await? {
            let dir_prefix = format!("{}/", self.full_key(path).trim_end_matches('/'));
            let mut pages = self
                .container
                .list_blobs()
                .prefix(dir_prefix)
                .into_stream();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| Self::map_azure_error(e, path))?;
                for blob in page.blobs.blobs() {
                    self.container
                        .blob_client(blob.name.clone())
                        .delete()
                        .await
                        .map_err(|e| Self::map_azure_error(e, path))?;
                }
            }
            return Ok(());
        }

        let blob = self.container.blob_client(self.full_key(path));
        blob.delete()
            .await
            .map_err(|e| Self::map_azure_error(e, path))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        let dir_prefix = if path.is_empty() {
            self.prefix
                .as_ref()
                .map(|p| format!("{p}/"))
                .unwrap_or_default()
        } else {
            format!("{}/", self.full_key(path).trim_end_matches('/'))
        };

        let mut results = Vec::new();
        let mut pages = self
            .container
            .list_blobs()
            .prefix(dir_prefix)
            .delimiter("/")
            .into_stream();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| Self::map_azure_error(e, path))?;
            for blob in page.blobs.blobs() {
                results.push(self.strip_prefix(&blob.name));
            }
            for prefix in page.blobs.prefixes() {
                results.push(self.strip_prefix(prefix.name.trim_end_matches('/')));
            }
        }
        results.sort();
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn mkdirs(&self, _path: &str) -> StorageResult<()> {
        // Blob containers have no directories; prefixes appear when blobs do.
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        match self.info(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn isfile(&self, path: &str) -> StorageResult<bool> {
        match self.info(path).await {
            Ok(meta) => Ok(!meta.is_directory),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn isdir(&self, path: &str) -> StorageResult<bool> {
        match self.info(path).await {
            Ok(meta) => Ok(meta.is_directory),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn backend_name(&self) -> &'static str {
        "azure"
    }
}
