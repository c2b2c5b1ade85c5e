//! Core type definitions for the flowerloop pipeline.
//!
//! This module contains the vocabulary shared by the prediction service, the
//! correction service and the modeller.
//!
//! # Key Types
//!
//! - [`Label`]: The five flower classes the classifier distinguishes
//! - [`ModelVersion`]: Unix-second version embedded in model blob names
//! - [`Prediction`]: JSON body returned by `POST /predict`
//! - [`CorrectionMessage`]: JSON payload carried by the correction queue
//!
//! # Examples
//!
//! ```rust
//! use flowerloop::types::{Label, ModelVersion};
//!
//! let label = Label::parse("tulips").unwrap();
//! assert_eq!(label.index(), 2);
//! assert_eq!(Label::parse("4").unwrap(), Label::Roses);
//!
//! let version = ModelVersion::new(1_700_000_000);
//! assert_eq!(version.iso(), "2023-11-14T22:13:20");
//! ```

use crate::error::{FlowerError, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of classes the classifier outputs.
pub const NUM_CLASSES: usize = 5;

/// A flower class.
///
/// The declaration order is the output order of the classifier and the integer
/// carried by correction messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Dandelion,
    Daisy,
    Tulips,
    Sunflowers,
    Roses,
}

impl Label {
    /// All labels in classifier output order.
    pub const ALL: [Label; NUM_CLASSES] = [
        Label::Dandelion,
        Label::Daisy,
        Label::Tulips,
        Label::Sunflowers,
        Label::Roses,
    ];

    /// Position of the label in the classifier output.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Lowercase class name.
    pub fn name(self) -> &'static str {
        match self {
            Label::Dandelion => "dandelion",
            Label::Daisy => "daisy",
            Label::Tulips => "tulips",
            Label::Sunflowers => "sunflowers",
            Label::Roses => "roses",
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Parse a class name (case-insensitive) or a decimal class index.
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if let Ok(index) = trimmed.parse::<usize>() {
            return Self::from_index(index)
                .ok_or_else(|| FlowerError::UnknownLabel(trimmed.to_string()));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|label| label.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| FlowerError::UnknownLabel(trimmed.to_string()))
    }

    /// Resolve a dataset directory name such as `roses` or `4_roses`.
    pub fn from_dir_name(dir: &str) -> Option<Self> {
        let name = match dir.split_once('_') {
            Some((prefix, rest)) if prefix.chars().all(|c| c.is_ascii_digit()) => rest,
            _ => dir,
        };
        Self::ALL
            .iter()
            .copied()
            .find(|label| label.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Model version: the Unix timestamp (seconds) embedded in the blob name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelVersion(pub u64);

impl ModelVersion {
    /// Version assumed when the store holds no well-formed model names.
    pub const DEFAULT: ModelVersion = ModelVersion(1);

    pub fn new(seconds: u64) -> Self {
        Self(seconds)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Version for the current wall-clock second.
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp().max(0) as u64)
    }

    /// ISO-8601 rendering of the version timestamp in UTC, without offset.
    pub fn iso(self) -> String {
        i64::try_from(self.0)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_else(|| self.0.to_string())
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Prediction returned by the prediction service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Class index.
    pub label: usize,
    /// Softmax probability of the predicted class.
    pub confidence: f32,
    /// Class name.
    pub prediction: String,
    /// Model version that produced the prediction.
    pub version: u64,
    /// ISO rendering of `version`.
    pub version_iso: String,
}

impl Prediction {
    pub fn new(label: Label, confidence: f32, version: ModelVersion) -> Self {
        Self {
            label: label.index(),
            confidence,
            prediction: label.name().to_string(),
            version: version.as_u64(),
            version_iso: version.iso(),
        }
    }
}

/// A user correction waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionMessage {
    /// Name of the uploaded image blob.
    pub blob_name: String,
    /// Corrected class index.
    pub label: u8,
}

impl CorrectionMessage {
    pub fn new(blob_name: impl Into<String>, label: Label) -> Self {
        Self {
            blob_name: blob_name.into(),
            label: label.index() as u8,
        }
    }

    /// Decode a queue payload.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The corrected label, if the index is in range.
    pub fn label(&self) -> Result<Label> {
        Label::from_index(self.label as usize)
            .ok_or_else(|| FlowerError::UnknownLabel(self.label.to_string()))
    }
}
