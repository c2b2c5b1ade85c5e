use super::{PredictState, IMAGE_FIELD};
use crate::error::{FlowerError, Result};
use crate::imaging;
use crate::observability;
use crate::types::{ModelVersion, Prediction};
use axum::extract::{Multipart, State};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, instrument};

/// Body of `GET /version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: u64,
    pub version_iso: String,
}

impl From<ModelVersion> for VersionInfo {
    fn from(version: ModelVersion) -> Self {
        Self {
            version: version.as_u64(),
            version_iso: version.iso(),
        }
    }
}

/// Pull the JPEG image field out of a multipart body.
pub(crate) async fn read_image_field(multipart: &mut Multipart) -> Result<Bytes> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| FlowerError::InvalidInput(e.body_text()))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        imaging::ensure_jpeg(field.content_type())?;
        return field
            .bytes()
            .await
            .map_err(|e| FlowerError::InvalidInput(e.body_text()));
    }
    Err(FlowerError::InvalidInput(format!("missing '{}' field", IMAGE_FIELD)))
}

/// Classify an uploaded JPEG with the latest model.
#[instrument(skip_all)]
pub async fn predict(State(state): State<PredictState>, mut multipart: Multipart) -> Result<Json<Prediction>> {
    let started = Instant::now();
    let result = classify(&state, &mut multipart).await;

    match result {
        Ok(prediction) => {
            observability::record_prediction(ModelVersion::new(prediction.version), started.elapsed());
            Ok(Json(prediction))
        }
        Err(e) => {
            observability::record_prediction_error(e.status_code().as_u16());
            Err(e)
        }
    }
}

async fn classify(state: &PredictState, multipart: &mut Multipart) -> Result<Prediction> {
    let data = read_image_field(multipart).await?;

    let version = state.registry.latest_version().await?;
    let model = state.registry.load(version).await?;
    let res = model.spec().input_res;

    let (label, confidence) = tokio::task::spawn_blocking(move || {
        let image = imaging::decode(&data, res)?;
        Ok::<_, FlowerError>(model.predict(&image)?.top())
    })
    .await
    .map_err(|e| FlowerError::Internal(format!("inference task failed: {}", e)))??;

    debug!(version = %version, label = %label, confidence, "Prediction");
    Ok(Prediction::new(label, confidence, version))
}

/// Latest model version.
pub async fn version(State(state): State<PredictState>) -> Result<Json<VersionInfo>> {
    let version = state.registry.latest_version().await?;
    Ok(Json(version.into()))
}

pub async fn health() -> &'static str {
    "OK"
}
