use super::handlers::CorrectionReceipt;
use super::LABEL_FIELD;
use crate::error::{FlowerError, Result};
use crate::predict::IMAGE_FIELD;
use crate::types::Label;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for a correction service.
#[derive(Clone)]
pub struct CorrectionsClient {
    base_url: String,
    client: Client,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

impl CorrectionsClient {
    pub fn new(url: &str) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            base_url: url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Submit a JPEG with its corrected label.
    pub async fn submit(&self, file_name: &str, data: Bytes, label: Label) -> Result<CorrectionReceipt> {
        let image = Part::bytes(data.to_vec())
            .file_name(file_name.to_string())
            .mime_str("image/jpeg")?;
        let form = Form::new()
            .part(IMAGE_FIELD, image)
            .text(LABEL_FIELD, label.name());

        let response = self
            .client
            .post(format!("{}/corrections", self.base_url))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.detail)
                .unwrap_or(text);
            return Err(FlowerError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}
