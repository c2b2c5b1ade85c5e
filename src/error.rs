//! Error types for the flowerloop pipeline.
//!
//! This module provides a unified error type [`FlowerError`] for all pipeline operations,
//! along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Storage**: Blob listing, download and upload errors
//! - **Queue**: Message send, receive and delete errors
//! - **Model**: Artifact decoding, version resolution and training errors
//! - **Input**: Rejected uploads, unknown labels, undecodable images
//! - **Configuration**: Invalid settings or missing configuration
//! - **Network**: Connection and timeout errors
//!
//! # Example
//!
//! ```rust
//! use flowerloop::error::{FlowerError, Result};
//!
//! fn check_content_type(content_type: &str) -> Result<()> {
//!     if content_type != "image/jpeg" {
//!         return Err(FlowerError::UnsupportedMediaType(content_type.into()));
//!     }
//!     Ok(())
//! }
//!
//! fn handle_error(err: &FlowerError) {
//!     if err.is_retryable() {
//!         println!("Retrying on the next tick...");
//!     } else {
//!         println!("Fatal error: {}", err);
//!     }
//! }
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::io;
use thiserror::Error;

/// Main error type for flowerloop operations.
#[derive(Error, Debug)]
pub enum FlowerError {
    // Storage errors
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Blob already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid blob name: {0}")]
    InvalidBlobName(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // Queue errors
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Pop receipt mismatch for message {0}")]
    PopReceiptMismatch(String),

    #[error("Queue error: {0}")]
    Queue(String),

    // Model errors
    #[error("Model version {0} not found")]
    ModelNotFound(u64),

    #[error("Incomplete model artifact: {0}")]
    IncompleteArtifact(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Unsupported artifact: {0}")]
    UnsupportedArtifact(String),

    #[error("Training failed: {0}")]
    Training(String),

    // Input errors
    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown label: {0}")]
    UnknownLabel(String),

    #[error("Image decode failed: {0}")]
    ImageDecode(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Network errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowerError {
    /// Check if error is retryable.
    ///
    /// Retryable errors leave the pipeline in a state where the next modeller
    /// tick or the next client request can succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowerError::IncompleteArtifact(_)
                | FlowerError::ChecksumMismatch { .. }
                | FlowerError::Storage(_)
                | FlowerError::Queue(_)
                | FlowerError::ConnectionFailed(_)
                | FlowerError::Network(_)
                | FlowerError::Io(_)
        )
    }

    /// HTTP status used when the error surfaces from a handler.
    pub fn status_code(&self) -> StatusCode {
        match self {
            FlowerError::UnsupportedMediaType(_)
            | FlowerError::InvalidInput(_)
            | FlowerError::UnknownLabel(_)
            | FlowerError::ImageDecode(_)
            | FlowerError::InvalidBlobName(_) => StatusCode::BAD_REQUEST,
            FlowerError::BlobNotFound(_) | FlowerError::MessageNotFound(_) => StatusCode::NOT_FOUND,
            FlowerError::AlreadyExists(_) | FlowerError::PopReceiptMismatch(_) => StatusCode::CONFLICT,
            FlowerError::ModelNotFound(_)
            | FlowerError::IncompleteArtifact(_)
            | FlowerError::ChecksumMismatch { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FlowerError::ConnectionFailed(_) | FlowerError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error body, shaped `{"detail": "..."}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for FlowerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (
            status,
            Json(ErrorBody {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<bincode::Error> for FlowerError {
    fn from(e: bincode::Error) -> Self {
        FlowerError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FlowerError {
    fn from(e: serde_json::Error) -> Self {
        FlowerError::Serialization(e.to_string())
    }
}

impl From<image::ImageError> for FlowerError {
    fn from(e: image::ImageError) -> Self {
        FlowerError::ImageDecode(e.to_string())
    }
}

impl From<zip::result::ZipError> for FlowerError {
    fn from(e: zip::result::ZipError) -> Self {
        FlowerError::Serialization(format!("zip archive: {}", e))
    }
}

impl From<reqwest::Error> for FlowerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            FlowerError::ConnectionFailed(e.to_string())
        } else {
            FlowerError::Network(e.to_string())
        }
    }
}

/// Result type alias for flowerloop operations.
pub type Result<T> = std::result::Result<T, FlowerError>;
