//! Object storage for images, datasets and model artifacts.
//!
//! The pipeline only needs flat, prefix-listable blob semantics from its
//! object store. [`BlobStore`] captures that surface; the managed service is
//! stood in for by [`FsBlobStore`] on a single host and by [`MemoryBlobStore`]
//! inside one process.

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use crate::error::{FlowerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Listing entry for a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    /// Full blob name, e.g. `models/model_1700000000.bin`.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub last_modified: DateTime<Utc>,
}

/// Flat object storage keyed by `/`-separated names.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List blobs whose names start with `prefix`, sorted by name.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobInfo>>;

    /// Download a blob.
    async fn get(&self, name: &str) -> Result<Bytes>;

    /// Upload a blob. With `overwrite = false` an existing blob is an error.
    async fn put(&self, name: &str, data: Bytes, overwrite: bool) -> Result<()>;

    /// Delete a blob.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Check whether a blob exists.
    async fn exists(&self, name: &str) -> Result<bool> {
        match self.get(name).await {
            Ok(_) => Ok(true),
            Err(FlowerError::BlobNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Reject names that are empty, absolute, or escape the container.
pub(crate) fn validate_blob_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return Err(FlowerError::InvalidBlobName(name.to_string()));
    }
    if name
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == ".." || segment.starts_with(".staging"))
    {
        return Err(FlowerError::InvalidBlobName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_blob_name() {
        assert!(validate_blob_name("models/model_1.bin").is_ok());
        assert!(validate_blob_name("uploads/2f1c.jpg").is_ok());
        assert!(validate_blob_name("").is_err());
        assert!(validate_blob_name("/etc/passwd").is_err());
        assert!(validate_blob_name("models/../../secret").is_err());
        assert!(validate_blob_name("models//x").is_err());
        assert!(validate_blob_name("models/").is_err());
        assert!(validate_blob_name(".staging/abc").is_err());
    }
}
