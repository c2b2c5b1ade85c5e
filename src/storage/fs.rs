use super::{validate_blob_name, BlobInfo, BlobStore};
use crate::error::{FlowerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Staging directory for in-flight uploads, excluded from listings.
const STAGING_DIR: &str = ".staging";

/// Directory-backed blob store.
///
/// Blob names map to paths below the root. Uploads are written to a staging
/// file and renamed into place, so a listing never shows a partial blob.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (and create) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_blob_name(name)?;
        Ok(self.root.join(name))
    }
}

fn not_found_as(name: &str, e: std::io::Error) -> FlowerError {
    if e.kind() == ErrorKind::NotFound {
        FlowerError::BlobNotFound(name.to_string())
    } else {
        FlowerError::Io(e)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobInfo>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let mut blobs = Vec::new();
            let walker = WalkDir::new(&root)
                .min_depth(1)
                .into_iter()
                .filter_entry(|e| e.file_name() != STAGING_DIR);

            for entry in walker {
                let entry = entry.map_err(|e| FlowerError::Storage(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = match entry.path().strip_prefix(&root) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !name.starts_with(&prefix) {
                    continue;
                }
                let metadata = entry.metadata().map_err(|e| FlowerError::Storage(e.to_string()))?;
                let last_modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                blobs.push(BlobInfo {
                    name,
                    size: metadata.len(),
                    last_modified,
                });
            }

            blobs.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(blobs)
        })
        .await
        .map_err(|e| FlowerError::Internal(format!("listing task failed: {}", e)))?
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        let path = self.path_for(name)?;
        let data = tokio::fs::read(&path).await.map_err(|e| not_found_as(name, e))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, name: &str, data: Bytes, overwrite: bool) -> Result<()> {
        let path = self.path_for(name)?;
        if !overwrite && tokio::fs::try_exists(&path).await? {
            return Err(FlowerError::AlreadyExists(name.to_string()));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let staging = self
            .root
            .join(STAGING_DIR)
            .join(uuid::Uuid::new_v4().to_string());
        tokio::fs::write(&staging, &data).await?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        debug!(blob = %name, bytes = data.len(), "Blob written");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| not_found_as(name, e))
    }
}
