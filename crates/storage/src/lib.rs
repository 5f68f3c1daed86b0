//! Remote filesystem abstraction and backends for ferry.
//!
//! This crate provides:
//! - The `RemoteFilesystem` capability trait consumed by the cache and
//!   transfer layers
//! - The `RootJail` wrapper confining every operation to a configured root
//! - Backends: local disk, S3-compatible object storage, Azure blob storage

pub mod backends;
pub mod error;
pub mod jail;
pub mod traits;

pub use backends::{azure::AzureBackend, local::LocalBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use jail::RootJail;
pub use traits::{ByteStream, Metadata, RemoteFilesystem};

use ferry_core::config::StorageConfig;
use std::sync::Arc;

/// Create a remote filesystem from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn RemoteFilesystem>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Local { path } => {
            let backend = LocalBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Azure {
            account,
            container,
            access_key,
            endpoint,
            prefix,
        } => {
            let backend = AzureBackend::new(
                account,
                container,
                access_key.clone(),
                endpoint.clone(),
                prefix.clone(),
            )?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::config::StorageConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_local_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Local {
            path: temp.path().join("store"),
        };

        let fs = from_config(&config).await.unwrap();
        assert_eq!(fs.backend_name(), "local");
        assert!(!fs.exists("anything").await.unwrap());
    }

    #[tokio::test]
    async fn from_config_rejects_partial_s3_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn from_config_azure_ok() {
        let config = StorageConfig::Azure {
            account: "devstoreaccount1".to_string(),
            container: "jobs".to_string(),
            access_key: None,
            endpoint: Some("http://127.0.0.1:10000/devstoreaccount1".to_string()),
            prefix: None,
        };

        let fs = from_config(&config).await.unwrap();
        assert_eq!(fs.backend_name(), "azure");
    }
}
