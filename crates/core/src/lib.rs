//! Core domain types shared across the ferry crates.
//!
//! This crate defines the canonical data model used everywhere else:
//! - Content hashes and reference keys for the local cache
//! - Storage backend configuration and the serializable settings descriptor
//! - The core error type

pub mod config;
pub mod error;
pub mod hash;

pub use config::{StorageConfig, StorageSettings};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};

/// Suffix appended to pointer record files in the cache directory.
pub const POINTER_SUFFIX: &str = "ref";

/// Default filename extension for stored log objects.
pub const LOG_FILE_SUFFIX: &str = "txt";

/// Default filename extension for stored directory archives.
pub const ARCHIVE_FILE_SUFFIX: &str = "tar.gz";
