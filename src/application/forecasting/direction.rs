//! Direction classifier with conditional magnitude
//!
//! Variant two of the forecaster: a softmax regression first classifies the
//! coming month as retrogressing, stable or advancing, then a per-class
//! magnitude estimate supplies the day delta. Confidence combines the class
//! probability with the class's historical magnitude error.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use super::features::{FeatureVector, TrainingRow, FEATURE_SCHEMA_VERSION};
use super::{holdout_metrics, DeltaPrediction, ModelArtifact, TrainMetrics};

pub const DIRECTION_MAGNITUDE_ID: &str = "direction-magnitude-v1";

const CLASS_RETROGRESSING: usize = 0;
const CLASS_STABLE: usize = 1;
const CLASS_ADVANCING: usize = 2;
const CLASS_COUNT: usize = 3;

/// Deltas within this band count as stable.
const STABLE_BAND_DAYS: f64 = 5.0;
const EPOCHS: usize = 400;
const LEARNING_RATE: f64 = 0.05;
/// Day scale against which magnitude error is normalized into confidence.
const MAGNITUDE_ERROR_SCALE: f64 = 90.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectionMagnitudeModel {
    /// (class, feature + bias) weight matrix, row-major.
    weights: Vec<Vec<f64>>,
    feature_means: Vec<f64>,
    feature_stds: Vec<f64>,
    class_mean_delta: [f64; CLASS_COUNT],
    class_mae: [f64; CLASS_COUNT],
}

impl Default for DirectionMagnitudeModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectionMagnitudeModel {
    pub fn new() -> Self {
        Self {
            weights: Vec::new(),
            feature_means: Vec::new(),
            feature_stds: Vec::new(),
            class_mean_delta: [-30.0, 0.0, 30.0],
            class_mae: [45.0; CLASS_COUNT],
        }
    }

    pub fn from_payload(payload: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(payload)?)
    }

    fn is_trained(&self) -> bool {
        !self.weights.is_empty()
    }

    fn fit(&mut self, rows: &[TrainingRow]) {
        let n = rows.len();
        let dim = FeatureVector::DIM;

        // Standardization parameters from the training rows.
        let raw: Vec<Vec<f64>> = rows.iter().map(|r| r.features.to_vec()).collect();
        let mut means = vec![0.0; dim];
        let mut stds = vec![0.0; dim];
        for feature in 0..dim {
            let mean = raw.iter().map(|r| r[feature]).sum::<f64>() / n as f64;
            let variance =
                raw.iter().map(|r| (r[feature] - mean).powi(2)).sum::<f64>() / n as f64;
            means[feature] = mean;
            stds[feature] = if variance.sqrt() > 1e-12 {
                variance.sqrt()
            } else {
                1.0
            };
        }
        self.feature_means = means;
        self.feature_stds = stds;

        // Design matrix with a trailing bias column.
        let mut x = Array2::<f64>::zeros((n, dim + 1));
        for (i, row) in raw.iter().enumerate() {
            for feature in 0..dim {
                x[[i, feature]] = (row[feature] - self.feature_means[feature])
                    / self.feature_stds[feature];
            }
            x[[i, dim]] = 1.0;
        }

        let labels: Vec<usize> = rows.iter().map(|r| class_of(r.target_delta)).collect();
        let mut y = Array2::<f64>::zeros((n, CLASS_COUNT));
        for (i, &label) in labels.iter().enumerate() {
            y[[i, label]] = 1.0;
        }

        // Plain batch gradient descent on the cross-entropy loss.
        let mut weights = Array2::<f64>::zeros((CLASS_COUNT, dim + 1));
        for _ in 0..EPOCHS {
            let probabilities = softmax_rows(&x.dot(&weights.t()));
            let gradient = (&probabilities - &y).t().dot(&x) / n as f64;
            weights = weights - gradient * LEARNING_RATE;
        }
        self.weights = weights
            .axis_iter(Axis(0))
            .map(|row| row.to_vec())
            .collect();

        // Per-class magnitude prototype and its historical error.
        for class in 0..CLASS_COUNT {
            let members: Vec<f64> = rows
                .iter()
                .zip(&labels)
                .filter(|(_, l)| **l == class)
                .map(|(r, _)| r.target_delta)
                .collect();
            if !members.is_empty() {
                let mean = members.iter().sum::<f64>() / members.len() as f64;
                self.class_mean_delta[class] = mean;
                self.class_mae[class] =
                    members.iter().map(|d| (d - mean).abs()).sum::<f64>() / members.len() as f64;
            }
        }
    }

    fn class_probabilities(&self, features: &FeatureVector) -> Array1<f64> {
        let dim = FeatureVector::DIM;
        let raw = features.to_vec();
        let mut x = Array1::<f64>::zeros(dim + 1);
        for feature in 0..dim {
            x[feature] = (raw[feature] - self.feature_means[feature]) / self.feature_stds[feature];
        }
        x[dim] = 1.0;

        let mut logits = Array1::<f64>::zeros(CLASS_COUNT);
        for (class, weights) in self.weights.iter().enumerate() {
            logits[class] = weights.iter().zip(x.iter()).map(|(w, v)| w * v).sum();
        }
        softmax(&logits)
    }

    fn raw_predict(&self, features: &FeatureVector) -> f64 {
        let probabilities = self.class_probabilities(features);
        let class = argmax(&probabilities);
        self.class_mean_delta[class]
    }
}

impl super::ForecastModel for DirectionMagnitudeModel {
    fn model_id(&self) -> &'static str {
        DIRECTION_MAGNITUDE_ID
    }

    fn train(&mut self, rows: &[TrainingRow]) -> Result<TrainMetrics> {
        if rows.is_empty() {
            bail!("cannot train on an empty series");
        }

        let split = ((rows.len() as f64) * 0.8).floor().max(1.0) as usize;
        let (train_rows, test_rows) = rows.split_at(split.min(rows.len()));

        let mut probe = self.clone();
        probe.fit(train_rows);
        let scored = if test_rows.is_empty() { train_rows } else { test_rows };
        let predictions: Vec<f64> = scored.iter().map(|r| probe.raw_predict(&r.features)).collect();
        let metrics = holdout_metrics(scored, &predictions, test_rows.len(), rows.len());

        self.fit(rows);
        Ok(metrics)
    }

    fn predict_delta(&self, features: &FeatureVector) -> Result<DeltaPrediction> {
        if !self.is_trained() {
            bail!("model has not been trained");
        }
        let probabilities = self.class_probabilities(features);
        let class = argmax(&probabilities);
        let probability = probabilities[class];
        let normalized_error = (self.class_mae[class] / MAGNITUDE_ERROR_SCALE).min(1.0);
        let confidence = (probability * (1.0 - normalized_error)).clamp(0.0, 1.0);

        Ok(DeltaPrediction {
            days: self.class_mean_delta[class],
            confidence,
        })
    }

    fn artifact(&self) -> Result<ModelArtifact> {
        Ok(ModelArtifact {
            feature_schema_version: FEATURE_SCHEMA_VERSION,
            model_id: DIRECTION_MAGNITUDE_ID.to_string(),
            payload: serde_json::to_value(self)?,
        })
    }
}

fn class_of(delta: f64) -> usize {
    if delta < -STABLE_BAND_DAYS {
        CLASS_RETROGRESSING
    } else if delta > STABLE_BAND_DAYS {
        CLASS_ADVANCING
    } else {
        CLASS_STABLE
    }
}

fn softmax(logits: &Array1<f64>) -> Array1<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Array1<f64> = logits.mapv(|l| (l - max).exp());
    let sum = exps.sum();
    exps / sum
}

fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|l| (l - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|l| l / sum);
    }
    out
}

fn argmax(values: &Array1<f64>) -> usize {
    let mut best = 0;
    for (i, value) in values.iter().enumerate() {
        if *value > values[best] {
            best = i;
        }
    }
    best
}
