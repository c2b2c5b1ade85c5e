use super::{CorrectionsState, LABEL_FIELD, UPLOAD_PREFIX};
use crate::error::{FlowerError, Result};
use crate::imaging;
use crate::observability;
use crate::predict::IMAGE_FIELD;
use crate::types::{CorrectionMessage, Label, Prediction};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Body returned for an accepted correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionReceipt {
    pub blob_name: String,
    pub label: u8,
    pub message_id: String,
}

/// Collected multipart fields of a correction.
#[derive(Default)]
struct CorrectionForm {
    image: Option<Bytes>,
    label: Option<String>,
}

async fn read_form(multipart: &mut Multipart) -> Result<CorrectionForm> {
    let mut form = CorrectionForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| FlowerError::InvalidInput(e.body_text()))?
    {
        match field.name() {
            Some(IMAGE_FIELD) => {
                imaging::ensure_jpeg(field.content_type())?;
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| FlowerError::InvalidInput(e.body_text()))?;
                form.image = Some(data);
            }
            Some(LABEL_FIELD) => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| FlowerError::InvalidInput(e.body_text()))?;
                form.label = Some(text);
            }
            _ => {}
        }
    }

    Ok(form)
}

/// Store a corrected image and enqueue it for retraining.
pub async fn submit_correction(
    State(state): State<CorrectionsState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<CorrectionReceipt>)> {
    let form = read_form(&mut multipart).await?;
    let image = form
        .image
        .ok_or_else(|| FlowerError::InvalidInput(format!("missing '{}' field", IMAGE_FIELD)))?;
    let label = Label::parse(
        form.label
            .as_deref()
            .ok_or_else(|| FlowerError::InvalidInput(format!("missing '{}' field", LABEL_FIELD)))?,
    )?;
    if image.is_empty() {
        return Err(FlowerError::InvalidInput("empty image".to_string()));
    }

    let blob_name = format!("{}{}.jpg", UPLOAD_PREFIX, Uuid::new_v4());
    state.blobs.put(&blob_name, image, false).await?;

    let message = CorrectionMessage::new(blob_name.clone(), label);
    let message_id = match state.queue.send_message(&message.to_json()?).await {
        Ok(id) => id,
        Err(e) => {
            if let Err(cleanup) = state.blobs.delete(&blob_name).await {
                warn!(blob = %blob_name, error = %cleanup, "Failed to remove orphaned upload");
            }
            return Err(e);
        }
    };

    observability::record_correction(label.name());
    info!(blob = %blob_name, label = %label, message_id = %message_id, "Correction enqueued");

    Ok((
        StatusCode::ACCEPTED,
        Json(CorrectionReceipt {
            blob_name,
            label: message.label,
            message_id,
        }),
    ))
}

/// Relay an image to the prediction service.
pub async fn proxy_predict(State(state): State<CorrectionsState>, mut multipart: Multipart) -> Response {
    let result = async {
        let data = crate::predict::read_image_field(&mut multipart).await?;
        state.predict.predict("upload.jpg", "image/jpeg", data).await
    }
    .await;

    match result {
        Ok(prediction) => Json::<Prediction>(prediction).into_response(),
        Err(FlowerError::ConnectionFailed(reason)) => {
            warn!(backend = %state.predict.base_url(), reason = %reason, "Prediction backend unreachable");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "detail": "Failed to connect to the backend." })),
            )
                .into_response()
        }
        Err(FlowerError::Upstream { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(serde_json::json!({ "detail": body }))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Class names in classifier output order.
pub async fn labels() -> Json<Vec<&'static str>> {
    Json(Label::ALL.iter().map(|label| label.name()).collect())
}

pub async fn health() -> &'static str {
    "OK"
}
