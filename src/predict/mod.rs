//! Prediction service.
//!
//! Every request resolves the latest model version, so a newly published
//! model is served from the next request on without a restart.

mod client;
mod handlers;

pub use client::PredictClient;
pub use handlers::{health, predict, version, VersionInfo};
pub(crate) use handlers::read_image_field;

use crate::config::PredictConfig;
use crate::error::{FlowerError, Result};
use crate::model::ModelRegistry;
use crate::shutdown::ShutdownCoordinator;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Multipart field carrying the uploaded image.
pub const IMAGE_FIELD: &str = "image_file";

/// Shared state for prediction handlers.
#[derive(Clone)]
pub struct PredictState {
    pub registry: Arc<ModelRegistry>,
}

/// Build the prediction router.
pub fn router(state: PredictState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/version", get(version))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// Run the prediction service until shutdown.
pub async fn run_predict_server(
    config: PredictConfig,
    registry: Arc<ModelRegistry>,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    let app = router(PredictState { registry }, config.max_upload_bytes);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "Prediction service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await
        .map_err(|e| FlowerError::Network(e.to_string()))?;

    info!("Prediction service stopped");
    Ok(())
}
