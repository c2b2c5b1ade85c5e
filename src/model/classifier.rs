// Flower classifier: softmax regression over pooled colour features

use crate::dataset::Sample;
use crate::error::{FlowerError, Result};
use crate::imaging::ImageTensor;
use crate::types::{Label, NUM_CLASSES};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Input geometry of a classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierSpec {
    /// Side length of the input images.
    pub input_res: u32,
    /// Side length of the average-pooling grid.
    pub pool_grid: u32,
}

impl ClassifierSpec {
    pub fn new(input_res: u32, pool_grid: u32) -> Self {
        Self {
            input_res,
            pool_grid,
        }
    }

    /// Length of the feature vector.
    pub fn num_features(&self) -> usize {
        (self.pool_grid as usize) * (self.pool_grid as usize) * 3
    }
}

impl Default for ClassifierSpec {
    fn default() -> Self {
        Self::new(crate::imaging::IMAGE_RES, 16)
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainConfig {
    /// Passes over the batch.
    pub epochs: usize,
    /// Gradient descent step size.
    pub learning_rate: f32,
    /// L2 penalty on weights.
    pub weight_decay: f32,
    /// Mini-batch size; `None` trains on the whole set as one batch.
    pub batch_size: Option<usize>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            learning_rate: 0.5,
            weight_decay: 1e-4,
            batch_size: None,
        }
    }
}

/// Per-epoch training losses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainHistory {
    pub epoch_losses: Vec<f32>,
}

impl TrainHistory {
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

/// Result of evaluating against a labelled set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub samples: usize,
    pub loss: f32,
    pub accuracy: f32,
}

/// Softmax output of one forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Scores {
    probabilities: [f32; NUM_CLASSES],
}

impl Scores {
    pub fn probabilities(&self) -> &[f32; NUM_CLASSES] {
        &self.probabilities
    }

    /// Most probable label and its probability.
    pub fn top(&self) -> (Label, f32) {
        let mut best = 0;
        for (i, p) in self.probabilities.iter().enumerate() {
            if *p > self.probabilities[best] {
                best = i;
            }
        }
        (Label::ALL[best], self.probabilities[best])
    }
}

/// Linear softmax classifier over average-pooled, L2-normalized RGB features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowerClassifier {
    spec: ClassifierSpec,
    /// Row-major `[NUM_CLASSES][num_features]`.
    weights: Vec<f32>,
    bias: Vec<f32>,
    /// Samples seen across all training runs.
    trained_samples: u64,
    /// Version this model was fine-tuned from.
    parent_version: Option<u64>,
}

impl FlowerClassifier {
    /// An untrained classifier; predicts the uniform distribution.
    pub fn new(spec: ClassifierSpec) -> Self {
        Self {
            spec,
            weights: vec![0.0; NUM_CLASSES * spec.num_features()],
            bias: vec![0.0; NUM_CLASSES],
            trained_samples: 0,
            parent_version: None,
        }
    }

    pub fn spec(&self) -> ClassifierSpec {
        self.spec
    }

    pub fn trained_samples(&self) -> u64 {
        self.trained_samples
    }

    pub fn parent_version(&self) -> Option<u64> {
        self.parent_version
    }

    pub fn set_parent_version(&mut self, version: u64) {
        self.parent_version = Some(version);
    }

    /// Check internal dimensions after deserialization.
    pub fn validate(&self) -> Result<()> {
        if self.spec.input_res == 0 || self.spec.pool_grid == 0 || self.spec.pool_grid > self.spec.input_res {
            return Err(FlowerError::UnsupportedArtifact(format!(
                "invalid geometry {:?}",
                self.spec
            )));
        }
        if self.weights.len() != NUM_CLASSES * self.spec.num_features() || self.bias.len() != NUM_CLASSES {
            return Err(FlowerError::UnsupportedArtifact(format!(
                "weight shape {}+{} does not match {:?}",
                self.weights.len(),
                self.bias.len(),
                self.spec
            )));
        }
        Ok(())
    }

    /// Average-pool the image over a `pool_grid`² grid and L2-normalize.
    pub fn features(&self, image: &ImageTensor) -> Result<Vec<f32>> {
        if image.res() != self.spec.input_res {
            return Err(FlowerError::InvalidInput(format!(
                "expected {}x{} input, got {}x{}",
                self.spec.input_res,
                self.spec.input_res,
                image.res(),
                image.res()
            )));
        }

        let res = self.spec.input_res as usize;
        let grid = self.spec.pool_grid as usize;
        let mut features = Vec::with_capacity(self.spec.num_features());

        for gy in 0..grid {
            let (y0, y1) = (gy * res / grid, (gy + 1) * res / grid);
            for gx in 0..grid {
                let (x0, x1) = (gx * res / grid, (gx + 1) * res / grid);
                let count = ((y1 - y0) * (x1 - x0)).max(1) as f32;
                let mut sums = [0.0f32; 3];
                for y in y0..y1 {
                    for x in x0..x1 {
                        for (c, sum) in sums.iter_mut().enumerate() {
                            *sum += image.at(y, x, c);
                        }
                    }
                }
                features.extend(sums.iter().map(|s| s / count));
            }
        }

        let norm = features.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            features.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(features)
    }

    fn logits(&self, features: &[f32]) -> [f32; NUM_CLASSES] {
        let n = features.len();
        let mut logits = [0.0f32; NUM_CLASSES];
        for (class, logit) in logits.iter_mut().enumerate() {
            let row = &self.weights[class * n..(class + 1) * n];
            *logit = self.bias[class] + row.iter().zip(features).map(|(w, x)| w * x).sum::<f32>();
        }
        logits
    }

    /// Run one forward pass.
    pub fn predict(&self, image: &ImageTensor) -> Result<Scores> {
        let features = self.features(image)?;
        Ok(Scores {
            probabilities: softmax(&self.logits(&features)),
        })
    }

    /// Fine-tune on `samples` and return per-epoch losses.
    pub fn fit<R: Rng + ?Sized>(
        &mut self,
        samples: &[Sample],
        config: &TrainConfig,
        rng: &mut R,
    ) -> Result<TrainHistory> {
        if samples.is_empty() {
            return Err(FlowerError::Training("no training samples".to_string()));
        }

        let encoded = samples
            .iter()
            .map(|s| Ok((self.features(&s.image)?, s.label.index())))
            .collect::<Result<Vec<_>>>()?;

        let batch_size = config.batch_size.unwrap_or(encoded.len()).clamp(1, encoded.len());
        let mut order: Vec<usize> = (0..encoded.len()).collect();
        let mut history = TrainHistory::default();

        for _ in 0..config.epochs {
            order.shuffle(rng);
            let mut epoch_loss = 0.0f32;
            for batch in order.chunks(batch_size) {
                epoch_loss += self.step(&encoded, batch, config);
            }
            history.epoch_losses.push(epoch_loss / encoded.len() as f32);
        }

        self.trained_samples += samples.len() as u64;
        Ok(history)
    }

    /// One gradient step on a batch; returns the summed pre-update loss.
    fn step(&mut self, encoded: &[(Vec<f32>, usize)], batch: &[usize], config: &TrainConfig) -> f32 {
        let n = self.spec.num_features();
        let mut grad_w = vec![0.0f32; self.weights.len()];
        let mut grad_b = [0.0f32; NUM_CLASSES];
        let mut loss = 0.0f32;

        for &i in batch {
            let (features, target) = &encoded[i];
            let probs = softmax(&self.logits(features));
            loss += cross_entropy(&probs, *target);

            for class in 0..NUM_CLASSES {
                let delta = probs[class] - if class == *target { 1.0 } else { 0.0 };
                grad_b[class] += delta;
                let row = &mut grad_w[class * n..(class + 1) * n];
                for (g, x) in row.iter_mut().zip(features) {
                    *g += delta * x;
                }
            }
        }

        let scale = config.learning_rate / batch.len() as f32;
        for (w, g) in self.weights.iter_mut().zip(&grad_w) {
            *w -= scale * g + config.learning_rate * config.weight_decay * *w;
        }
        for (b, g) in self.bias.iter_mut().zip(&grad_b) {
            *b -= scale * g;
        }
        loss
    }

    /// Mean loss and accuracy on a labelled set.
    pub fn evaluate(&self, samples: &[Sample]) -> Result<EvalReport> {
        if samples.is_empty() {
            return Ok(EvalReport::default());
        }

        let mut loss = 0.0f32;
        let mut correct = 0usize;
        for sample in samples {
            let scores = self.predict(&sample.image)?;
            loss += cross_entropy(scores.probabilities(), sample.label.index());
            if scores.top().0 == sample.label {
                correct += 1;
            }
        }

        Ok(EvalReport {
            samples: samples.len(),
            loss: loss / samples.len() as f32,
            accuracy: correct as f32 / samples.len() as f32,
        })
    }
}

fn softmax(logits: &[f32; NUM_CLASSES]) -> [f32; NUM_CLASSES] {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut out = [0.0f32; NUM_CLASSES];
    let mut sum = 0.0f32;
    for (o, l) in out.iter_mut().zip(logits) {
        *o = (l - max).exp();
        sum += *o;
    }
    out.iter_mut().for_each(|o| *o /= sum);
    out
}

fn cross_entropy(probs: &[f32; NUM_CLASSES], target: usize) -> f32 {
    -probs[target].max(1e-7).ln()
}
