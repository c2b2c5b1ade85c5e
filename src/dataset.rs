//! Labelled image sets.
//!
//! Validation images are laid out one directory per class: inside a zip
//! archive blob (`datasets/val_data.zip`), under a blob prefix
//! (`datasets/val/{class}/{file}`) or in a local directory
//! (`{dir}/{class}/{file}`). A class directory is named `roses` or
//! `4_roses`.

use crate::error::{FlowerError, Result};
use crate::imaging::{self, ImageTensor};
use crate::storage::BlobStore;
use crate::types::Label;
use bytes::Bytes;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

/// One labelled image.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: ImageTensor,
    pub label: Label,
}

impl Sample {
    pub fn new(image: ImageTensor, label: Label) -> Self {
        Self { image, label }
    }
}

/// The static set every retrained model is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct ValidationSet {
    samples: Vec<Sample>,
}

impl ValidationSet {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Load every image under `prefix` in the blob store.
    pub async fn from_blobs(store: &dyn BlobStore, prefix: &str, res: u32) -> Result<Self> {
        let prefix = match prefix {
            "" => String::new(),
            p if p.ends_with('/') => p.to_string(),
            p => format!("{}/", p),
        };
        let mut samples = Vec::new();

        for blob in store.list(&prefix).await? {
            let relative = &blob.name[prefix.len()..];
            let Some((class_dir, _file)) = relative.split_once('/') else {
                warn!(blob = %blob.name, "Skipping validation blob outside a class directory");
                continue;
            };
            let Some(label) = Label::from_dir_name(class_dir) else {
                warn!(blob = %blob.name, class_dir, "Skipping unknown validation class");
                continue;
            };

            let bytes = store.get(&blob.name).await?;
            match imaging::decode(&bytes, res) {
                Ok(image) => samples.push(Sample::new(image, label)),
                Err(e) => warn!(blob = %blob.name, error = %e, "Skipping undecodable validation image"),
            }
        }

        info!(prefix = %prefix, samples = samples.len(), "Loaded validation set from blobs");
        Ok(Self::new(samples))
    }

    /// Load every image in a zip archive blob.
    ///
    /// Each file's parent directory names its class, wherever that directory
    /// sits in the archive.
    pub async fn from_archive(store: &dyn BlobStore, name: &str, res: u32) -> Result<Self> {
        let data = store.get(name).await?;
        let samples = tokio::task::spawn_blocking(move || load_archive(data, res))
            .await
            .map_err(|e| FlowerError::Internal(format!("validation loader panicked: {}", e)))??;
        info!(archive = name, samples = samples.len(), "Loaded validation set from archive");
        Ok(Self::new(samples))
    }

    /// Load every image below a local directory.
    pub async fn from_dir(dir: &Path, res: u32) -> Result<Self> {
        let dir = dir.to_path_buf();
        let samples = tokio::task::spawn_blocking(move || load_dir(&dir, res))
            .await
            .map_err(|e| FlowerError::Internal(format!("validation loader panicked: {}", e)))??;
        Ok(Self::new(samples))
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Side length the images were decoded to; `None` for an empty set.
    pub fn resolution(&self) -> Option<u32> {
        self.samples.first().map(|sample| sample.image.res())
    }

    /// Sample count per label, in classifier output order.
    pub fn class_counts(&self) -> [usize; crate::types::NUM_CLASSES] {
        let mut counts = [0; crate::types::NUM_CLASSES];
        for sample in &self.samples {
            counts[sample.label.index()] += 1;
        }
        counts
    }
}

fn load_archive(data: Bytes, res: u32) -> Result<Vec<Sample>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    let mut samples = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let Some(path) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "Skipping archive entry with an unsafe path");
            continue;
        };
        if path.starts_with("__MACOSX") {
            continue;
        }

        let class_dir = path
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(label) = Label::from_dir_name(&class_dir) else {
            warn!(entry = %path.display(), class_dir, "Skipping unknown validation class");
            continue;
        };

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        match imaging::decode(&bytes, res) {
            Ok(image) => samples.push(Sample::new(image, label)),
            Err(e) => warn!(entry = %path.display(), error = %e, "Skipping undecodable validation image"),
        }
    }

    Ok(samples)
}

fn load_dir(dir: &Path, res: u32) -> Result<Vec<Sample>> {
    if !dir.is_dir() {
        return Err(FlowerError::Config(format!(
            "validation directory {} does not exist",
            dir.display()
        )));
    }

    let mut samples = Vec::new();
    for entry in WalkDir::new(dir).min_depth(2).max_depth(2).sort_by_file_name() {
        let entry = entry.map_err(|e| FlowerError::Storage(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let class_dir = path
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(label) = Label::from_dir_name(&class_dir) else {
            warn!(path = %path.display(), class_dir, "Skipping unknown validation class");
            continue;
        };

        let bytes = std::fs::read(path)?;
        match imaging::decode(&bytes, res) {
            Ok(image) => samples.push(Sample::new(image, label)),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping undecodable validation image"),
        }
    }

    info!(dir = %dir.display(), samples = samples.len(), "Loaded validation set from directory");
    Ok(samples)
}
