//! Observability module for flowerloop.
//!
//! Provides logging and Prometheus metrics.

use crate::config::ObservabilityConfig;
use crate::error::{FlowerError, Result};
use crate::shutdown::ShutdownCoordinator;
use crate::types::ModelVersion;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging. `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| FlowerError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| FlowerError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics server until shutdown.
pub async fn run_metrics_server(config: ObservabilityConfig, shutdown: ShutdownCoordinator) -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| FlowerError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();

    let app = axum::Router::new()
        .route("/metrics", axum::routing::get(move || async move { handle.render() }))
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await
        .map_err(|e| FlowerError::Network(e.to_string()))?;

    Ok(())
}

/// Register standard metrics so they render before the first event.
fn register_metrics() {
    // Prediction service
    counter!("flowerloop_predictions_total").absolute(0);
    counter!("flowerloop_prediction_errors_total").absolute(0);
    gauge!("flowerloop_serving_version").set(0.0);
    counter!("flowerloop_model_cache_hits_total").absolute(0);
    counter!("flowerloop_model_cache_misses_total").absolute(0);

    // Correction service
    counter!("flowerloop_corrections_total").absolute(0);

    // Modeller
    gauge!("flowerloop_queue_depth").set(0.0);
    counter!("flowerloop_drained_messages_total").absolute(0);
    counter!("flowerloop_skipped_messages_total").absolute(0);
    counter!("flowerloop_retrains_total").absolute(0);
    counter!("flowerloop_retrain_failures_total").absolute(0);
    gauge!("flowerloop_published_version").set(0.0);
    gauge!("flowerloop_validation_accuracy").set(0.0);
}

/// Record a served prediction.
pub fn record_prediction(version: ModelVersion, latency: Duration) {
    counter!("flowerloop_predictions_total").increment(1);
    gauge!("flowerloop_serving_version").set(version.as_u64() as f64);
    histogram!("flowerloop_prediction_seconds").record(latency.as_secs_f64());
}

/// Record a failed prediction request.
pub fn record_prediction_error(status: u16) {
    counter!("flowerloop_prediction_errors_total", "status" => status.to_string()).increment(1);
}

/// Record an accepted correction.
pub fn record_correction(label: &str) {
    counter!("flowerloop_corrections_total", "label" => label.to_string()).increment(1);
}

/// Update the observed queue depth.
pub fn update_queue_depth(depth: usize) {
    gauge!("flowerloop_queue_depth").set(depth as f64);
}

/// Record the outcome of a queue drain.
pub fn record_drain(drained: usize, skipped: usize) {
    counter!("flowerloop_drained_messages_total").increment(drained as u64);
    counter!("flowerloop_skipped_messages_total").increment(skipped as u64);
}

/// Record a published retrain.
pub fn record_retrain(version: ModelVersion, accuracy: f32, duration: Duration) {
    counter!("flowerloop_retrains_total").increment(1);
    gauge!("flowerloop_published_version").set(version.as_u64() as f64);
    gauge!("flowerloop_validation_accuracy").set(f64::from(accuracy));
    histogram!("flowerloop_retrain_seconds").record(duration.as_secs_f64());
}

/// Record a retrain that did not publish.
pub fn record_retrain_failure() {
    counter!("flowerloop_retrain_failures_total").increment(1);
}
