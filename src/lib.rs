//! flowerloop - a continual-learning pipeline for a flower image classifier.
//!
//! A prediction service serves the latest published model, a correction
//! service collects relabelled images from users, and a modeller folds the
//! queued corrections back into the model and publishes a new version.
//!
//! # Architecture
//!
//! ```text
//!   user ──► corrections ──► uploads/{uuid}.jpg  +  queue {blob_name,label}
//!                │                                          │
//!                ▼                                          ▼
//!             predict ◄── models/model_{ts}.bin ◄──── modeller
//!                          (latest = max ts)       (depth > 4: drain,
//!                                                   train, evaluate, publish)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use flowerloop::config::FlowerConfig;
//!
//! #[tokio::main]
//! async fn main() -> flowerloop::Result<()> {
//!     let config = FlowerConfig::development();
//!     flowerloop::run(config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod cache;
pub mod dataset;
pub mod imaging;
pub mod model;
pub mod queue;
pub mod shutdown;
pub mod storage;

pub mod corrections;
pub mod modeller;
pub mod predict;

pub mod cli;
pub mod observability;

// Re-exports
pub use error::{FlowerError, Result};
pub use types::*;

use config::{FlowerConfig, StorageBackend, StorageConfig};
use model::ModelRegistry;
use modeller::Modeller;
use queue::{FsQueue, MemoryQueue, MessageQueue};
use shutdown::{ServiceSet, ShutdownCoordinator, SignalHandler};
use std::future::Future;
use std::sync::Arc;
use storage::{BlobStore, FsBlobStore, MemoryBlobStore};
use tracing::{error, info, warn};

/// Blob store and correction queue a node works against.
#[derive(Clone)]
pub struct Backends {
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn MessageQueue>,
}

/// Open the configured storage backends.
pub fn open_backends(config: &StorageConfig) -> Result<Backends> {
    match config.backend {
        StorageBackend::Filesystem => {
            let blobs = FsBlobStore::open(config.container_dir())?;
            let queue = FsQueue::open(config.queue_dir())?;
            info!(
                root = %config.root.display(),
                container = %config.container,
                queue = %config.queue,
                "Opened filesystem storage"
            );
            Ok(Backends {
                blobs: Arc::new(blobs),
                queue: Arc::new(queue),
            })
        }
        StorageBackend::Memory => Ok(Backends {
            blobs: Arc::new(MemoryBlobStore::new()),
            queue: Arc::new(MemoryQueue::new()),
        }),
    }
}

/// Spawn a service that initiates shutdown if it fails.
fn spawn_service<F>(services: &mut ServiceSet, coordinator: &ShutdownCoordinator, name: &'static str, service: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let coordinator = coordinator.clone();
    services.spawn(name, async move {
        let result = service.await;
        if let Err(e) = &result {
            error!(service = name, error = %e, "Service exited with error");
            coordinator.shutdown();
        }
        result
    });
}

/// Run a flowerloop node with the given configuration.
pub async fn run(config: FlowerConfig) -> Result<()> {
    observability::init(&config.observability)?;
    config.validate()?;

    let role = config.node.role;
    info!(node = %config.node.name, role = ?role, "Starting flowerloop node");

    if config.storage.backend == StorageBackend::Memory && role != config::NodeRole::Combined {
        warn!("Memory storage is private to this process; other roles will not see its data");
    }

    let backends = open_backends(&config.storage)?;
    let registry = Arc::new(ModelRegistry::new(
        backends.blobs.clone(),
        config.model.clone(),
        config.predict.cache_capacity,
    ));

    let coordinator = ShutdownCoordinator::new();
    let mut services = ServiceSet::new();

    if role.runs_predict() {
        spawn_service(
            &mut services,
            &coordinator,
            "predict",
            predict::run_predict_server(config.predict.clone(), registry.clone(), coordinator.clone()),
        );
    }

    if role.runs_corrections() {
        spawn_service(
            &mut services,
            &coordinator,
            "corrections",
            corrections::run_corrections_server(
                config.corrections.clone(),
                backends.blobs.clone(),
                backends.queue.clone(),
                coordinator.clone(),
            ),
        );
    }

    if role.runs_modeller() {
        let validation =
            Modeller::load_validation(&config.modeller, &config.model, backends.blobs.as_ref()).await?;
        let modeller = Modeller::new(
            backends.blobs.clone(),
            backends.queue.clone(),
            registry.clone(),
            config.modeller.clone(),
            validation,
        );
        spawn_service(&mut services, &coordinator, "modeller", modeller.run(coordinator.clone()));
    }

    if config.observability.metrics_enabled {
        spawn_service(
            &mut services,
            &coordinator,
            "metrics",
            observability::run_metrics_server(config.observability.clone(), coordinator.clone()),
        );
    }

    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = SignalHandler::new(signal_coordinator).run().await {
            error!(error = %e, "Failed to install signal handlers");
        }
    });

    coordinator.wait_for_shutdown().await;
    info!("Shutting down flowerloop gracefully...");

    services.join(coordinator.timeout()).await;

    info!("flowerloop shutdown complete");
    Ok(())
}
