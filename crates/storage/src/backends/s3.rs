//! S3-compatible backend using the AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, Metadata, RemoteFilesystem};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use std::path::Path;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// S3-compatible object store.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// `force_path_style` selects path-style URLs (`endpoint/bucket/key`),
    /// required for MinIO and LocalStack; AWS S3 wants virtual-hosted style.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() != secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let shared_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "ferry-config");
            builder = builder.credentials_provider(credentials);
        }

        if let Some(endpoint_url) = endpoint {
            // Accept bare host:port endpoints (e.g. "minio:9000").
            let endpoint_lower = endpoint_url.to_ascii_lowercase();
            let normalized = if endpoint_lower.starts_with("http://")
                || endpoint_lower.starts_with("https://")
            {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            };
            builder = builder.endpoint_url(&normalized);

            // Explicit HTTP endpoints get an HTTP-only client so SDK setup
            // does not depend on native trust roots.
            if normalized.to_ascii_lowercase().starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            builder = builder.force_path_style(true);
        }

        let normalized_prefix = prefix.map(|p| p.trim_end_matches('/').to_string());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix: normalized_prefix,
        })
    }

    /// Apply the configured key prefix.
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

    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err {
            if service_err.raw().status().as_u16() == 404 {
                return StorageError::NotFound(key.to_string());
            }
        }
        StorageError::Backend(Box::new(err))
    }

    /// Whether any object exists under `key/` (object stores have no real
    /// directories; a non-empty prefix is the closest equivalent).
    async fn has_children(&self, key: &str) -> StorageResult<bool> {
        let dir_prefix = format!("{}/", self.full_key(key).trim_end_matches('/'));
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&dir_prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;
        Ok(output.key_count().unwrap_or(0) > 0)
    }
}

#[async_trait]
impl RemoteFilesystem for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn info(&self, path: &str) -> StorageResult<Metadata> {
        let full_key = self.full_key(path);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(output) => Ok(Metadata {
                size: output.content_length().map(|len| len as u64),
                revision_token: output
                    .e_tag()
                    .map(|etag| etag.trim_matches('"').to_string()),
                is_directory: false,
            }),
            Err(err) => {
                let mapped = Self::map_sdk_error(err, path);
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

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn open(&self, path: &str) -> StorageResult<ByteStream> {
        let full_key = self.full_key(path);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, path))?;

        let reader = output.body.into_async_read();
        let stream = ReaderStream::new(reader);

        use futures::StreamExt;
        Ok(Box::pin(stream.map(|result| result.map_err(StorageError::Io))))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, path: &str, local: &Path) -> StorageResult<()> {
        use futures::StreamExt;
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

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn put(&self, local: &Path, path: &str) -> StorageResult<()> {
        let full_key = self.full_key(path);
        let body = aws_sdk_s3::primitives::ByteStream::from_path(local)
            .await
            .map_err(|e| StorageError::Backend(Box::new(e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(body)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, path))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, path: &str, recursive: bool) -> StorageResult<()> {
        if recursive && self.isdir(path).await? {
            let keys = self.walk(path).await?;
            for key in keys {
                let full_key = self.full_key(&key);
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error(e, &key))?;
            }
            return Ok(());
        }

        // delete_object does not fail for missing keys, so probe first to
        // surface NotFound to callers.
        if !self.exists(path).await? {
            return Err(StorageError::NotFound(path.to_string()));
        }
        let full_key = self.full_key(path);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, path))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
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
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&dir_prefix)
                .delimiter("/");
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, path))?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    results.push(self.strip_prefix(key));
                }
            }
            for common in output.common_prefixes() {
                if let Some(dir) = common.prefix() {
                    results.push(self.strip_prefix(dir.trim_end_matches('/')));
                }
            }

            match output.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }
        results.sort();
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn mkdirs(&self, _path: &str) -> StorageResult<()> {
        // Object stores have no directories; prefixes appear when keys do.
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        match self.info(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn isfile(&self, path: &str) -> StorageResult<bool> {
        match self.info(path).await {
            Ok(meta) => Ok(!meta.is_directory),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn isdir(&self, path: &str) -> StorageResult<bool> {
        match self.info(path).await {
            Ok(meta) => Ok(meta.is_directory),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

impl S3Backend {
    /// Collect every key under a directory-like prefix (recursive).
    async fn walk(&self, path: &str) -> StorageResult<Vec<String>> {
        let dir_prefix = format!("{}/", self.full_key(path).trim_end_matches('/'));
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&dir_prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, path))?;
            for object in output.contents() {
                if let Some(key) = object.key() {
                    results.push(self.strip_prefix(key));
                }
            }
            match output.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(results)
    }
}
