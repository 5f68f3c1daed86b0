//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage (a directory shared between processes).
    Local {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, LocalStack, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO
        /// and some S3-compatible services; AWS S3 wants virtual-hosted style.
        #[serde(default)]
        force_path_style: bool,
    },
    /// Azure blob storage.
    Azure {
        /// Storage account name.
        account: String,
        /// Blob container name.
        container: String,
        /// Account access key. Falls back to anonymous access if not set.
        access_key: Option<String>,
        /// Optional endpoint URL (for Azurite, sovereign clouds).
        endpoint: Option<String>,
        /// Optional blob name prefix.
        prefix: Option<String>,
    },
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            StorageConfig::Azure { account, container, .. } => {
                if account.is_empty() || container.is_empty() {
                    return Err(
                        "azure config requires a non-empty account and container".to_string()
                    );
                }
                Ok(())
            }
            StorageConfig::Local { .. } => Ok(()),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            path: PathBuf::from("./data/storage"),
        }
    }
}

/// Complete settings descriptor for one configured store.
///
/// Serializable so a driver can hand the descriptor to workers that
/// reconstruct an identical store on their side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Backend selection and connection parameters.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Root all references are resolved against (the jail root).
    #[serde(default)]
    pub root_dir: String,
    /// Local cache directory shared across runs. `None` disables caching.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl StorageSettings {
    /// Serialize to a JSON descriptor.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Deserialize from a JSON descriptor.
    pub fn from_json(s: &str) -> crate::Result<Self> {
        serde_json::from_str(s).map_err(|e| crate::Error::Config(e.to_string()))
    }
}
