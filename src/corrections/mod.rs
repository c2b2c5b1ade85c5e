//! Correction service.
//!
//! The HTTP surface a labelling front end talks to: it relays predictions to
//! the prediction service and turns submitted corrections into an uploaded
//! image plus a queue message for the modeller.

mod client;
mod handlers;

pub use client::CorrectionsClient;
pub use handlers::{health, labels, proxy_predict, submit_correction, CorrectionReceipt};

use crate::config::CorrectionsConfig;
use crate::error::{FlowerError, Result};
use crate::predict::PredictClient;
use crate::queue::MessageQueue;
use crate::shutdown::ShutdownCoordinator;
use crate::storage::BlobStore;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Blob prefix for uploaded correction images.
pub const UPLOAD_PREFIX: &str = "uploads/";

/// Multipart field carrying the corrected label.
pub const LABEL_FIELD: &str = "label";

/// Shared state for correction handlers.
#[derive(Clone)]
pub struct CorrectionsState {
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn MessageQueue>,
    pub predict: PredictClient,
}

/// Build the correction router.
pub fn router(state: CorrectionsState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/corrections", post(submit_correction))
        .route("/predict", post(proxy_predict))
        .route("/labels", get(labels))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// Run the correction service until shutdown.
pub async fn run_corrections_server(
    config: CorrectionsConfig,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn MessageQueue>,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    let state = CorrectionsState {
        blobs,
        queue,
        predict: PredictClient::new(&config.predict_url),
    };
    let app = router(state, config.max_upload_bytes);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        addr = %config.bind_addr,
        predict_url = %config.predict_url,
        "Correction service listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await
        .map_err(|e| FlowerError::Network(e.to_string()))?;

    info!("Correction service stopped");
    Ok(())
}
