//! Backend implementations of [`crate::traits::RemoteFilesystem`].

pub mod azure;
pub mod local;
pub mod s3;
