//! Bagged regression-stump ensemble
//!
//! A deliberately small tree ensemble: each member is a depth-one
//! regression tree fit on a seeded bootstrap sample. Spread across member
//! predictions drives the confidence score.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::features::{FeatureVector, TrainingRow};
use super::{holdout_metrics, DeltaPrediction, ModelArtifact, TrainMetrics};

pub const STUMP_ENSEMBLE_ID: &str = "stump-ensemble-v1";

const DEFAULT_TREES: usize = 60;
const BOOTSTRAP_SEED: u64 = 0x5eed_cafe;
/// Day scale against which ensemble spread is normalized into confidence.
const CONFIDENCE_DAY_SCALE: f64 = 90.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Stump {
    feature: usize,
    threshold: f64,
    left_value: f64,
    right_value: f64,
}

impl Stump {
    fn predict(&self, features: &[f64]) -> f64 {
        if features[self.feature] <= self.threshold {
            self.left_value
        } else {
            self.right_value
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StumpEnsemble {
    trees: usize,
    seed: u64,
    stumps: Vec<Stump>,
}

impl Default for StumpEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl StumpEnsemble {
    pub fn new() -> Self {
        Self {
            trees: DEFAULT_TREES,
            seed: BOOTSTRAP_SEED,
            stumps: Vec::new(),
        }
    }

    pub fn from_payload(payload: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(payload)?)
    }

    fn fit(&self, rows: &[TrainingRow]) -> Vec<Stump> {
        let matrix: Vec<Vec<f64>> = rows.iter().map(|r| r.features.to_vec()).collect();
        let targets: Vec<f64> = rows.iter().map(|r| r.target_delta).collect();
        let n = rows.len();
        let mut rng = fastrand::Rng::with_seed(self.seed);

        (0..self.trees)
            .map(|_| {
                let sample: Vec<usize> = (0..n).map(|_| rng.usize(0..n)).collect();
                best_stump(&matrix, &targets, &sample)
            })
            .collect()
    }
}

impl super::ForecastModel for StumpEnsemble {
    fn model_id(&self) -> &'static str {
        STUMP_ENSEMBLE_ID
    }

    fn train(&mut self, rows: &[TrainingRow]) -> Result<TrainMetrics> {
        if rows.is_empty() {
            bail!("cannot train on an empty series");
        }

        // Chronological holdout: fit on the head, score on the tail, then
        // refit on everything for the final model.
        let split = ((rows.len() as f64) * 0.8).floor().max(1.0) as usize;
        let (train_rows, test_rows) = rows.split_at(split.min(rows.len()));

        let probe = Self {
            stumps: self.fit(train_rows),
            ..self.clone()
        };
        let scored = if test_rows.is_empty() { train_rows } else { test_rows };
        let predictions: Vec<f64> = scored
            .iter()
            .map(|row| probe.raw_predict(&row.features.to_vec()))
            .collect();
        let metrics = holdout_metrics(scored, &predictions, test_rows.len(), rows.len());

        self.stumps = self.fit(rows);
        Ok(metrics)
    }

    fn predict_delta(&self, features: &FeatureVector) -> Result<DeltaPrediction> {
        if self.stumps.is_empty() {
            bail!("model has not been trained");
        }
        let flat = features.to_vec();
        let member_predictions: Vec<f64> = self.stumps.iter().map(|s| s.predict(&flat)).collect();
        let mean = member_predictions.iter().sum::<f64>() / member_predictions.len() as f64;
        let variance = member_predictions
            .iter()
            .map(|p| (p - mean) * (p - mean))
            .sum::<f64>()
            / member_predictions.len() as f64;
        let spread = variance.sqrt();
        let confidence = (1.0 - (spread / CONFIDENCE_DAY_SCALE)).clamp(0.05, 0.95);

        Ok(DeltaPrediction {
            days: mean,
            confidence,
        })
    }

    fn artifact(&self) -> Result<ModelArtifact> {
        Ok(ModelArtifact {
            feature_schema_version: super::features::FEATURE_SCHEMA_VERSION,
            model_id: STUMP_ENSEMBLE_ID.to_string(),
            payload: serde_json::to_value(self)?,
        })
    }
}

impl StumpEnsemble {
    fn raw_predict(&self, flat: &[f64]) -> f64 {
        if self.stumps.is_empty() {
            return 0.0;
        }
        self.stumps.iter().map(|s| s.predict(flat)).sum::<f64>() / self.stumps.len() as f64
    }
}

/// Exhaustive search over features and split points, minimizing the summed
/// squared error of the two leaf means.
fn best_stump(matrix: &[Vec<f64>], targets: &[f64], sample: &[usize]) -> Stump {
    let sample_mean = sample.iter().map(|&i| targets[i]).sum::<f64>() / sample.len() as f64;
    let mut best = Stump {
        feature: 0,
        threshold: f64::NEG_INFINITY,
        left_value: sample_mean,
        right_value: sample_mean,
    };
    let mut best_sse = f64::INFINITY;

    for feature in 0..FeatureVector::DIM {
        let mut values: Vec<f64> = sample.iter().map(|&i| matrix[i][feature]).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup();
        if values.len() < 2 {
            continue;
        }

        for pair in values.windows(2) {
            let threshold = (pair[0] + pair[1]) / 2.0;
            let (mut left_sum, mut left_n, mut right_sum, mut right_n) = (0.0, 0usize, 0.0, 0usize);
            for &i in sample {
                if matrix[i][feature] <= threshold {
                    left_sum += targets[i];
                    left_n += 1;
                } else {
                    right_sum += targets[i];
                    right_n += 1;
                }
            }
            if left_n == 0 || right_n == 0 {
                continue;
            }
            let left_mean = left_sum / left_n as f64;
            let right_mean = right_sum / right_n as f64;
            let sse: f64 = sample
                .iter()
                .map(|&i| {
                    let predicted = if matrix[i][feature] <= threshold {
                        left_mean
                    } else {
                        right_mean
                    };
                    let diff = targets[i] - predicted;
                    diff * diff
                })
                .sum();
            if sse < best_sse {
                best_sse = sse;
                best = Stump {
                    feature,
                    threshold,
                    left_value: left_mean,
                    right_value: right_mean,
                };
            }
        }
    }
    best
}
