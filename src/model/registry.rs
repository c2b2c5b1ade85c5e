// Model Registry backed by the blob store

use super::artifact;
use super::classifier::{ClassifierSpec, FlowerClassifier};
use crate::cache::{CacheStats, ModelCache};
use crate::config::ModelConfig;
use crate::error::{FlowerError, Result};
use crate::storage::BlobStore;
use crate::types::ModelVersion;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Extract the version from a model blob name.
///
/// The version is the second `_`-separated segment of the name, up to its
/// first `.`: `models/model_1700000000.bin` is version `1700000000`.
pub fn parse_model_version(name: &str) -> Option<ModelVersion> {
    let segment = name.split('_').nth(1)?;
    let digits = segment.split('.').next()?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok().map(ModelVersion::new)
}

/// Version to publish next: the current time, bumped past `latest` if the
/// clock has not moved beyond it.
pub fn next_version(latest: ModelVersion, now: ModelVersion) -> ModelVersion {
    now.max(ModelVersion::new(latest.as_u64().saturating_add(1)))
}

/// Resolves, loads and publishes model versions.
pub struct ModelRegistry {
    /// Blob store holding the artifacts
    blobs: Arc<dyn BlobStore>,
    /// Naming and geometry
    config: ModelConfig,
    /// Memoized artifact bytes
    cache: ModelCache,
}

impl ModelRegistry {
    pub fn new(blobs: Arc<dyn BlobStore>, config: ModelConfig, cache_capacity: usize) -> Self {
        Self {
            blobs,
            config,
            cache: ModelCache::new(cache_capacity),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Geometry of newly created classifiers.
    pub fn classifier_spec(&self) -> ClassifierSpec {
        ClassifierSpec::new(self.config.input_res, self.config.pool_grid)
    }

    /// Blob name of a version.
    pub fn blob_name(&self, version: ModelVersion) -> String {
        format!(
            "{}{}_{}.{}",
            self.config.prefix, self.config.stem, version, self.config.extension
        )
    }

    /// Versions of all well-formed model names, ascending.
    pub async fn list_versions(&self) -> Result<Vec<ModelVersion>> {
        let mut versions = Vec::new();
        for blob in self.blobs.list(&self.config.prefix).await? {
            match parse_model_version(&blob.name) {
                Some(version) => versions.push(version),
                None => warn!(blob = %blob.name, "Skipping malformed model name"),
            }
        }
        versions.sort_unstable();
        versions.dedup();
        Ok(versions)
    }

    /// Highest published version, or [`ModelVersion::DEFAULT`] when none parse.
    pub async fn latest_version(&self) -> Result<ModelVersion> {
        let latest = self
            .list_versions()
            .await?
            .last()
            .copied()
            .unwrap_or(ModelVersion::DEFAULT);

        debug!(version = %latest, version_iso = %latest.iso(), "Resolved latest model version");
        Ok(latest)
    }

    /// Artifact bytes of a version, memoized.
    pub async fn load_bytes(&self, version: ModelVersion) -> Result<Bytes> {
        if let Some(bytes) = self.cache.get(version).await {
            return Ok(bytes);
        }

        let name = self.blob_name(version);
        let bytes = match self.blobs.get(&name).await {
            Ok(bytes) => bytes,
            Err(FlowerError::BlobNotFound(_)) => return Err(FlowerError::ModelNotFound(version.as_u64())),
            Err(e) => return Err(e),
        };

        info!(version = %version, blob = %name, size = bytes.len(), "Downloaded model");
        self.cache.put(version, bytes.clone()).await;
        Ok(bytes)
    }

    /// Load and validate a version.
    pub async fn load(&self, version: ModelVersion) -> Result<FlowerClassifier> {
        let bytes = self.load_bytes(version).await?;
        match artifact::decode(&bytes) {
            Ok(model) => Ok(model),
            Err(e) => {
                // Never keep bytes that failed to decode; the next call refetches.
                self.cache.remove(version).await;
                Err(e)
            }
        }
    }

    /// Resolve the latest version and load it.
    pub async fn load_latest(&self) -> Result<(ModelVersion, FlowerClassifier)> {
        let version = self.latest_version().await?;
        let model = self.load(version).await?;
        Ok((version, model))
    }

    /// Upload a classifier as `version`, replacing any existing blob.
    pub async fn publish(&self, model: &FlowerClassifier, version: ModelVersion) -> Result<String> {
        let name = self.blob_name(version);
        let bytes = artifact::encode(model)?;
        let size = bytes.len();

        self.blobs.put(&name, bytes, true).await?;
        self.cache.remove(version).await;

        info!(
            version = %version,
            version_iso = %version.iso(),
            blob = %name,
            size,
            "Published model"
        );
        Ok(name)
    }

    /// Publish an untrained version-1 model when no model exists yet.
    pub async fn bootstrap(&self) -> Result<Option<ModelVersion>> {
        if !self.list_versions().await?.is_empty() {
            return Ok(None);
        }

        let model = FlowerClassifier::new(self.classifier_spec());
        self.publish(&model, ModelVersion::DEFAULT).await?;
        Ok(Some(ModelVersion::DEFAULT))
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }
}
