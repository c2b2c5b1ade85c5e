//! Retraining loop.
//!
//! On every tick the modeller checks the correction queue; once more than
//! `threshold` corrections wait, it loads the latest model, drains the queue,
//! fine-tunes on the drained batch, evaluates against the validation set and
//! publishes the result as a new timestamped version.

mod drain;

pub use drain::{drain_queue, DrainOptions, DrainReport};

use crate::config::{ModelConfig, ModellerConfig};
use crate::dataset::ValidationSet;
use crate::error::{FlowerError, Result};
use crate::model::{next_version, EvalReport, ModelRegistry, TrainConfig, TrainHistory};
use crate::observability;
use crate::queue::MessageQueue;
use crate::shutdown::{ShutdownAware, ShutdownCoordinator};
use crate::storage::BlobStore;
use crate::types::ModelVersion;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// What a tick did.
#[derive(Debug)]
pub enum TickOutcome {
    /// Not enough corrections queued.
    Idle { depth: usize },
    /// The queue looked deep enough but the drain produced no samples.
    NothingDrained { depth: usize, report: DrainReport },
    /// A new version was published.
    Published(Box<RetrainSummary>),
}

/// Summary of a published retrain.
#[derive(Debug)]
pub struct RetrainSummary {
    pub parent: ModelVersion,
    pub version: ModelVersion,
    pub blob_name: String,
    pub samples: usize,
    pub skipped: usize,
    pub history: TrainHistory,
    pub evaluation: EvalReport,
}

/// The queue-drain-retrain-publish loop.
pub struct Modeller {
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn MessageQueue>,
    registry: Arc<ModelRegistry>,
    config: ModellerConfig,
    validation: Arc<ValidationSet>,
    rng: StdRng,
}

impl Modeller {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn MessageQueue>,
        registry: Arc<ModelRegistry>,
        config: ModellerConfig,
        validation: ValidationSet,
    ) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            blobs,
            queue,
            registry,
            config,
            validation: Arc::new(validation),
            rng,
        }
    }

    /// Load the validation set named by the configuration.
    pub async fn load_validation(
        config: &ModellerConfig,
        model: &ModelConfig,
        blobs: &dyn BlobStore,
    ) -> Result<ValidationSet> {
        let set = match &config.validation_dir {
            Some(dir) => ValidationSet::from_dir(dir, model.input_res).await?,
            None if blobs.exists(&config.validation_archive).await? => {
                ValidationSet::from_archive(blobs, &config.validation_archive, model.input_res).await?
            }
            None => ValidationSet::from_blobs(blobs, &config.validation_prefix, model.input_res).await?,
        };
        if set.is_empty() {
            warn!("Validation set is empty, retrained models will not be evaluated");
        }
        Ok(set)
    }

    pub fn validation(&self) -> &ValidationSet {
        &self.validation
    }

    fn train_config(&self) -> TrainConfig {
        let model = self.registry.config();
        TrainConfig {
            epochs: self.config.epochs,
            learning_rate: model.learning_rate,
            weight_decay: model.weight_decay,
            batch_size: None,
        }
    }

    /// Run one poll of the loop.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let depth = self.queue.approximate_message_count().await?;
        observability::update_queue_depth(depth);

        if depth <= self.config.threshold {
            info!(depth, threshold = self.config.threshold, "No images to process");
            return Ok(TickOutcome::Idle { depth });
        }

        // Load before draining so a missing model leaves the queue untouched.
        let parent = self.registry.latest_version().await?;
        let mut model = self.registry.load(parent).await?;
        let model_res = model.spec().input_res;
        if let Some(validation_res) = self.validation.resolution() {
            if validation_res != model_res {
                return Err(FlowerError::InvalidConfig {
                    field: "model.input_res".to_string(),
                    reason: format!(
                        "validation images are {}px but model {} expects {}px",
                        validation_res, parent, model_res
                    ),
                });
            }
        }
        let version = next_version(parent, ModelVersion::now());
        info!(
            depth,
            parent = %parent,
            version = %version,
            version_iso = %version.iso(),
            "Retraining"
        );

        let options = DrainOptions {
            page_size: self.config.receive_batch,
            visibility_timeout: self.config.visibility_timeout,
            image_res: model_res,
        };
        let mut report = drain_queue(self.blobs.as_ref(), self.queue.as_ref(), options).await;
        observability::record_drain(report.deleted, report.skipped);

        if report.samples.is_empty() {
            warn!(depth, skipped = report.skipped, "Drain produced no training samples");
            return Ok(TickOutcome::NothingDrained { depth, report });
        }

        let started = Instant::now();
        let samples = std::mem::take(&mut report.samples);
        let sample_count = samples.len();
        let config = self.train_config();
        let validation = self.validation.clone();
        let mut rng = StdRng::seed_from_u64(self.rng.gen());

        let (model, history, evaluation) = tokio::task::spawn_blocking(move || {
            let history = model.fit(&samples, &config, &mut rng)?;
            let evaluation = model.evaluate(validation.samples())?;
            model.set_parent_version(parent.as_u64());
            Ok::<_, FlowerError>((model, history, evaluation))
        })
        .await
        .map_err(|e| FlowerError::Internal(format!("training task failed: {}", e)))??;

        info!(
            samples = sample_count,
            final_loss = history.final_loss().unwrap_or_default(),
            val_samples = evaluation.samples,
            val_loss = evaluation.loss,
            val_accuracy = evaluation.accuracy,
            "Training complete"
        );

        let blob_name = self.registry.publish(&model, version).await?;
        observability::record_retrain(version, evaluation.accuracy, started.elapsed());

        Ok(TickOutcome::Published(Box::new(RetrainSummary {
            parent,
            version,
            blob_name,
            samples: sample_count,
            skipped: report.skipped,
            history,
            evaluation,
        })))
    }

    /// Tick every poll interval until shutdown.
    pub async fn run(mut self, shutdown: ShutdownCoordinator) -> Result<()> {
        if let Some(version) = self.registry.bootstrap().await? {
            info!(version = %version, "Published initial untrained model");
        }
        info!(
            threshold = self.config.threshold,
            poll_interval = ?self.config.poll_interval,
            validation_samples = self.validation.len(),
            "Modeller started"
        );

        while !shutdown.is_shutting_down() {
            match self.tick().await {
                Ok(TickOutcome::Published(summary)) => info!(
                    version = %summary.version,
                    blob = %summary.blob_name,
                    samples = summary.samples,
                    "Published retrained model"
                ),
                Ok(_) => {}
                Err(e) => {
                    observability::record_retrain_failure();
                    error!(error = %e, retryable = e.is_retryable(), "Modeller tick failed, retrying next tick");
                }
            }

            if tokio::time::sleep(self.config.poll_interval)
                .with_shutdown(&shutdown)
                .await
                .is_none()
            {
                break;
            }
        }

        info!("Modeller stopped");
        Ok(())
    }
}
