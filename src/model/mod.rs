//! Flower classification model.
//!
//! - [`classifier`]: the trainable classifier itself
//! - [`artifact`]: the byte envelope models are published in
//! - [`registry`]: version resolution, loading and publishing against the blob store

pub mod artifact;
pub mod classifier;
pub mod registry;

pub use classifier::{ClassifierSpec, EvalReport, FlowerClassifier, Scores, TrainConfig, TrainHistory};
pub use registry::{next_version, parse_model_version, ModelRegistry};
