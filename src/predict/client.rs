use super::handlers::VersionInfo;
use super::IMAGE_FIELD;
use crate::error::{FlowerError, Result};
use crate::types::Prediction;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;
use std::time::Duration;

/// Default connection timeout for client requests.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default request timeout for client operations.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for a prediction service.
#[derive(Clone)]
pub struct PredictClient {
    base_url: String,
    client: Client,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

impl PredictClient {
    /// Create a client for `url`, either the service root or its `/predict`
    /// endpoint.
    pub fn new(url: &str) -> Self {
        Self::with_timeouts(url, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeouts(url: &str, connect_timeout: Duration, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        let trimmed = url.trim_end_matches('/');
        let base_url = trimmed.strip_suffix("/predict").unwrap_or(trimmed).to_string();

        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Post an image for classification.
    pub async fn predict(&self, file_name: &str, content_type: &str, data: Bytes) -> Result<Prediction> {
        let part = Part::bytes(data.to_vec())
            .file_name(file_name.to_string())
            .mime_str(content_type)?;
        let form = Form::new().part(IMAGE_FIELD, part);

        let response = self
            .client
            .post(format!("{}/predict", self.base_url))
            .multipart(form)
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }

    /// Latest model version served.
    pub async fn version(&self) -> Result<VersionInfo> {
        let response = self
            .client
            .get(format!("{}/version", self.base_url))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Check service health.
    pub async fn health(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

/// Turn non-success responses into [`FlowerError::Upstream`].
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.detail)
        .unwrap_or(text);
    Err(FlowerError::Upstream {
        status: status.as_u16(),
        body,
    })
}
