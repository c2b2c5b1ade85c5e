use super::{validate_blob_name, BlobInfo, BlobStore};
use crate::error::{FlowerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

struct StoredBlob {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

/// In-process blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobInfo>> {
        let blobs = self.blobs.read();
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, blob)| BlobInfo {
                name: name.clone(),
                size: blob.data.len() as u64,
                last_modified: blob.last_modified,
            })
            .collect())
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        self.blobs
            .read()
            .get(name)
            .map(|blob| blob.data.clone())
            .ok_or_else(|| FlowerError::BlobNotFound(name.to_string()))
    }

    async fn put(&self, name: &str, data: Bytes, overwrite: bool) -> Result<()> {
        validate_blob_name(name)?;
        let mut blobs = self.blobs.write();
        if !overwrite && blobs.contains_key(name) {
            return Err(FlowerError::AlreadyExists(name.to_string()));
        }
        blobs.insert(
            name.to_string(),
            StoredBlob {
                data,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.blobs
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FlowerError::BlobNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryBlobStore::new();
        store
            .put("uploads/a.jpg", Bytes::from_static(b"jpeg"), false)
            .await
            .unwrap();

        assert_eq!(store.get("uploads/a.jpg").await.unwrap(), Bytes::from_static(b"jpeg"));
        assert!(store.exists("uploads/a.jpg").await.unwrap());

        store.delete("uploads/a.jpg").await.unwrap();
        assert!(!store.exists("uploads/a.jpg").await.unwrap());
        assert!(matches!(
            store.delete("uploads/a.jpg").await,
            Err(FlowerError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_overwrite_flag() {
        let store = MemoryBlobStore::new();
        store.put("models/model_1.bin", Bytes::from_static(b"v1"), false).await.unwrap();

        let err = store
            .put("models/model_1.bin", Bytes::from_static(b"v2"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowerError::AlreadyExists(_)));

        store.put("models/model_1.bin", Bytes::from_static(b"v2"), true).await.unwrap();
        assert_eq!(store.get("models/model_1.bin").await.unwrap(), Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryBlobStore::new();
        for name in ["models/model_2.bin", "models/model_1.bin", "uploads/x.jpg", "modelsx/y"] {
            store.put(name, Bytes::from_static(b"."), false).await.unwrap();
        }

        let names: Vec<_> = store
            .list("models/")
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, ["models/model_1.bin", "models/model_2.bin"]);
        assert_eq!(store.list("").await.unwrap().len(), 4);
    }
}
