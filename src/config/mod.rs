//! Configuration module for flowerloop.

use crate::error::{FlowerError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a flowerloop node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowerConfig {
    /// Node configuration.
    #[serde(default)]
    pub node: NodeConfig,
    /// Prediction service configuration.
    #[serde(default)]
    pub predict: PredictConfig,
    /// Correction service configuration.
    #[serde(default)]
    pub corrections: CorrectionsConfig,
    /// Modeller loop configuration.
    #[serde(default)]
    pub modeller: ModellerConfig,
    /// Model artifact configuration.
    #[serde(default)]
    pub model: ModelConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl FlowerConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowerError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            FlowerError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Recognised keys: `STORAGE_ROOT`, `STORAGE_CONTAINER`, `STORAGE_QUEUE`,
    /// `PREDICT_URL` and `FLOWERLOOP_ROLE`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("STORAGE_ROOT") {
            self.storage.backend = StorageBackend::Filesystem;
            self.storage.root = PathBuf::from(root);
        }
        if let Some(container) = lookup("STORAGE_CONTAINER") {
            self.storage.container = container;
        }
        if let Some(queue) = lookup("STORAGE_QUEUE") {
            self.storage.queue = queue;
        }
        if let Some(url) = lookup("PREDICT_URL") {
            self.corrections.predict_url = url;
        }
        if let Some(role) = lookup("FLOWERLOOP_ROLE") {
            self.node.role = role.parse()?;
        }
        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.storage.container.is_empty() {
            return Err(FlowerError::InvalidConfig {
                field: "storage.container".to_string(),
                reason: "Container name must be non-empty".to_string(),
            });
        }

        if self.storage.queue.is_empty() {
            return Err(FlowerError::InvalidConfig {
                field: "storage.queue".to_string(),
                reason: "Queue name must be non-empty".to_string(),
            });
        }

        if self.modeller.epochs == 0 {
            return Err(FlowerError::InvalidConfig {
                field: "modeller.epochs".to_string(),
                reason: "At least one epoch is required".to_string(),
            });
        }

        if self.modeller.receive_batch == 0 {
            return Err(FlowerError::InvalidConfig {
                field: "modeller.receive_batch".to_string(),
                reason: "Receive batch must be non-zero".to_string(),
            });
        }

        if self.predict.cache_capacity == 0 {
            return Err(FlowerError::InvalidConfig {
                field: "predict.cache_capacity".to_string(),
                reason: "Model cache must hold at least one version".to_string(),
            });
        }

        if self.model.input_res == 0 || self.model.pool_grid == 0 {
            return Err(FlowerError::InvalidConfig {
                field: "model".to_string(),
                reason: "input_res and pool_grid must be non-zero".to_string(),
            });
        }

        if self.model.pool_grid > self.model.input_res {
            return Err(FlowerError::InvalidConfig {
                field: "model.pool_grid".to_string(),
                reason: "Pool grid cannot exceed the input resolution".to_string(),
            });
        }

        if !self.modeller.validation_prefix.ends_with('/') {
            return Err(FlowerError::InvalidConfig {
                field: "modeller.validation_prefix".to_string(),
                reason: "Prefix must end with '/'".to_string(),
            });
        }

        if !self.model.prefix.ends_with('/') {
            return Err(FlowerError::InvalidConfig {
                field: "model.prefix".to_string(),
                reason: "Prefix must end with '/'".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                name: "dev-node".to_string(),
                role: NodeRole::Combined,
            },
            predict: PredictConfig {
                bind_addr: "127.0.0.1:8000".parse().expect("valid socket address"),
                cache_capacity: 5,
                max_upload_bytes: default_max_upload_bytes(),
            },
            corrections: CorrectionsConfig {
                bind_addr: "127.0.0.1:8501".parse().expect("valid socket address"),
                predict_url: "http://127.0.0.1:8000/predict".to_string(),
                max_upload_bytes: default_max_upload_bytes(),
            },
            modeller: ModellerConfig {
                poll_interval: Duration::from_secs(2),
                ..ModellerConfig::default()
            },
            model: ModelConfig::default(),
            storage: StorageConfig {
                backend: StorageBackend::Filesystem,
                root: PathBuf::from("/tmp/flowerloop"),
                container: "flowers".to_string(),
                queue: "corrections".to_string(),
            },
            observability: ObservabilityConfig {
                metrics_enabled: false,
                ..ObservabilityConfig::default()
            },
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name.
    pub name: String,
    /// Which services this node runs.
    pub role: NodeRole,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "flowerloop-node".to_string(),
            role: NodeRole::Combined,
        }
    }
}

/// Node role enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Prediction service only.
    Predict,
    /// Correction service only.
    Corrections,
    /// Retraining loop only.
    Modeller,
    /// Every service in one process.
    Combined,
}

impl NodeRole {
    pub fn runs_predict(&self) -> bool {
        matches!(self, NodeRole::Predict | NodeRole::Combined)
    }

    pub fn runs_corrections(&self) -> bool {
        matches!(self, NodeRole::Corrections | NodeRole::Combined)
    }

    pub fn runs_modeller(&self) -> bool {
        matches!(self, NodeRole::Modeller | NodeRole::Combined)
    }
}

impl std::str::FromStr for NodeRole {
    type Err = FlowerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "predict" => Ok(NodeRole::Predict),
            "corrections" | "ui" => Ok(NodeRole::Corrections),
            "modeller" | "modeler" => Ok(NodeRole::Modeller),
            "combined" | "all" => Ok(NodeRole::Combined),
            other => Err(FlowerError::InvalidConfig {
                field: "node.role".to_string(),
                reason: format!("unknown role '{}'", other),
            }),
        }
    }
}

/// Prediction service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictConfig {
    /// Address to bind the prediction service.
    pub bind_addr: SocketAddr,
    /// Number of model versions whose bytes are memoized.
    pub cache_capacity: usize,
    /// Upload body limit in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".parse().expect("valid socket address"),
            cache_capacity: 5,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

/// Correction service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionsConfig {
    /// Address to bind the correction service.
    pub bind_addr: SocketAddr,
    /// Prediction endpoint the correction service proxies to.
    pub predict_url: String,
    /// Upload body limit in bytes.
    pub max_upload_bytes: usize,
}

impl Default for CorrectionsConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8501".parse().expect("valid socket address"),
            predict_url: "http://127.0.0.1:8000/predict".to_string(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Modeller loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModellerConfig {
    /// Retraining starts once the queue holds more than this many messages.
    pub threshold: usize,
    /// Delay between queue polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Training epochs per retrain.
    pub epochs: usize,
    /// Messages requested per receive call.
    pub receive_batch: usize,
    /// How long a received message stays hidden from other consumers.
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,
    /// Zip archive of class directories, preferred when the blob exists.
    #[serde(default = "default_validation_archive")]
    pub validation_archive: String,
    /// Blob prefix holding the validation images.
    pub validation_prefix: String,
    /// Local validation directory, used instead of the blob prefix when set.
    #[serde(default)]
    pub validation_dir: Option<PathBuf>,
    /// Seed for batch shuffling.
    pub seed: u64,
}

impl Default for ModellerConfig {
    fn default() -> Self {
        Self {
            threshold: 4,
            poll_interval: Duration::from_secs(10),
            epochs: 3,
            receive_batch: 32,
            visibility_timeout: Duration::from_secs(30),
            validation_archive: default_validation_archive(),
            validation_prefix: "datasets/val/".to_string(),
            validation_dir: None,
            seed: 123,
        }
    }
}

fn default_validation_archive() -> String {
    "datasets/val_data.zip".to_string()
}

/// Model artifact and classifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Blob prefix for model artifacts.
    pub prefix: String,
    /// File stem preceding the `_{version}` segment.
    pub stem: String,
    /// File extension of model artifacts.
    pub extension: String,
    /// Side length images are resized to.
    pub input_res: u32,
    /// Side length of the average-pooling grid used as features.
    pub pool_grid: u32,
    /// Gradient descent step size.
    pub learning_rate: f32,
    /// L2 penalty applied to weights.
    pub weight_decay: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            prefix: "models/".to_string(),
            stem: "model".to_string(),
            extension: "bin".to_string(),
            input_res: 224,
            pool_grid: 16,
            learning_rate: 0.5,
            weight_decay: 1e-4,
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Directory-backed blobs and queue, shareable across processes on one host.
    Filesystem,
    /// In-process only.
    Memory,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend kind.
    pub backend: StorageBackend,
    /// Root directory for the filesystem backend.
    pub root: PathBuf,
    /// Blob container name.
    pub container: String,
    /// Correction queue name.
    pub queue: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Filesystem,
            root: PathBuf::from("/var/lib/flowerloop"),
            container: "flowers".to_string(),
            queue: "corrections".to_string(),
        }
    }
}

impl StorageConfig {
    /// Directory holding the blob container.
    pub fn container_dir(&self) -> PathBuf {
        self.root.join("blobs").join(&self.container)
    }

    /// Directory holding the queue messages.
    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queues").join(&self.queue)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: "0.0.0.0:9090".parse().expect("valid socket address"),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
