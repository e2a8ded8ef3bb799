//! Cutoff forecasting
//!
//! Two interchangeable regressors behind one trait: a bagged stump ensemble
//! and a direction classifier with conditional magnitude. Series shorter
//! than the observation floor get the null forecast instead of a trained
//! model.

pub mod direction;
pub mod features;
pub mod stump;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::domain::constants::{FY_CEILING, FY_FLOOR, MAX_FORECAST_DELTA_DAYS, MIN_OBS};
use crate::domain::repositories::BulletinRepository;
use crate::domain::trend::{Forecast, ForecastKey, NULL_FORECASTER_ID};

use direction::DirectionMagnitudeModel;
use features::{dated_observations, features_at, training_rows, FeatureVector, TrainingRow};
use stump::StumpEnsemble;

/// Error metrics from the chronological holdout evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics {
    pub mae_days: f64,
    pub rmse_days: f64,
    /// Fraction of rows held out for evaluation.
    pub held_out_split: f64,
}

/// A model's raw output before clamping and date arithmetic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaPrediction {
    pub days: f64,
    pub confidence: f64,
}

/// Serialized model with the feature layout it was trained against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub feature_schema_version: u32,
    pub model_id: String,
    pub payload: serde_json::Value,
}

/// Contract shared by both regressor variants.
pub trait ForecastModel: Send + Sync + std::fmt::Debug {
    fn model_id(&self) -> &'static str;
    fn train(&mut self, rows: &[TrainingRow]) -> Result<TrainMetrics>;
    fn predict_delta(&self, features: &FeatureVector) -> Result<DeltaPrediction>;
    fn artifact(&self) -> Result<ModelArtifact>;
}

/// Which regressor variant to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Ensemble,
    DirectionMagnitude,
}

impl ModelKind {
    pub fn build(self) -> Box<dyn ForecastModel> {
        match self {
            ModelKind::Ensemble => Box::new(StumpEnsemble::new()),
            ModelKind::DirectionMagnitude => Box::new(DirectionMagnitudeModel::new()),
        }
    }
}

/// Write a trained model artifact to disk.
pub fn save_model(model: &dyn ForecastModel, path: &Path) -> Result<()> {
    let artifact = model.artifact()?;
    let json = serde_json::to_string_pretty(&artifact)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Load a model artifact, failing loudly on an incompatible feature schema
/// or an unknown model id.
pub fn load_model(path: &Path) -> Result<Box<dyn ForecastModel>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let artifact: ModelArtifact = serde_json::from_str(&json)?;

    if artifact.feature_schema_version != features::FEATURE_SCHEMA_VERSION {
        bail!(
            "model artifact uses feature schema {} but this build expects {}",
            artifact.feature_schema_version,
            features::FEATURE_SCHEMA_VERSION
        );
    }

    match artifact.model_id.as_str() {
        stump::STUMP_ENSEMBLE_ID => Ok(Box::new(StumpEnsemble::from_payload(artifact.payload)?)),
        direction::DIRECTION_MAGNITUDE_ID => Ok(Box::new(DirectionMagnitudeModel::from_payload(
            artifact.payload,
        )?)),
        other => bail!("unknown model id '{other}' in artifact"),
    }
}

/// Trains on the stored series and produces a persisted forecast.
pub struct Forecaster {
    repo: Arc<dyn BulletinRepository>,
}

impl Forecaster {
    pub fn new(repo: Arc<dyn BulletinRepository>) -> Self {
        Self { repo }
    }

    /// Produce, store and return a forecast for one target month. Returns
    /// the holdout metrics where a model was actually trained.
    pub async fn forecast(
        &self,
        key: ForecastKey,
        kind: ModelKind,
        save_model_to: Option<&Path>,
    ) -> Result<(Forecast, Option<TrainMetrics>)> {
        let series = self
            .repo
            .get_series(key.category, key.country, key.chart, FY_FLOOR, FY_CEILING)
            .await?;
        let observations = dated_observations(&series);
        let last_observed = observations.last().map(|(_, cutoff)| *cutoff);

        if observations.len() < MIN_OBS {
            info!(
                category = %key.category,
                country = %key.country,
                observations = observations.len(),
                "series too short, emitting null forecast"
            );
            let forecast = Forecast {
                key,
                predicted_date: last_observed,
                confidence: 0.0,
                model_id: NULL_FORECASTER_ID.to_string(),
                produced_at: Utc::now(),
                features_hash: null_features_hash(&key, observations.len()),
            };
            self.repo.put_forecast(&forecast).await?;
            return Ok((forecast, None));
        }

        let rows = training_rows(&observations, key.category, key.country);
        let mut model = kind.build();
        let metrics = model.train(&rows)?;

        let features = features_at(
            &observations,
            observations.len() - 1,
            key.category,
            key.country,
            key.target_year,
            key.target_month,
        );
        let prediction = model.predict_delta(&features)?;
        let clamped_days = (prediction.days.round() as i64)
            .clamp(-MAX_FORECAST_DELTA_DAYS, MAX_FORECAST_DELTA_DAYS);
        let predicted_date = last_observed.map(|date| date + Duration::days(clamped_days));

        let forecast = Forecast {
            key,
            predicted_date,
            confidence: prediction.confidence,
            model_id: model.model_id().to_string(),
            produced_at: Utc::now(),
            features_hash: features.hash(),
        };
        self.repo.put_forecast(&forecast).await?;

        if let Some(path) = save_model_to {
            save_model(model.as_ref(), path)?;
        }

        info!(
            category = %key.category,
            country = %key.country,
            model = model.model_id(),
            days = clamped_days,
            confidence = forecast.confidence,
            "forecast produced"
        );
        Ok((forecast, Some(metrics)))
    }
}

/// Digest for forecasts that never saw a feature vector.
fn null_features_hash(key: &ForecastKey, observations: usize) -> String {
    let json = serde_json::to_vec(&(key, observations)).unwrap_or_default();
    let digest = Sha256::digest(&json);
    format!("{digest:x}")
}

/// Shared holdout scoring for both model variants.
pub(crate) fn holdout_metrics(
    scored: &[TrainingRow],
    predictions: &[f64],
    held_out: usize,
    total: usize,
) -> TrainMetrics {
    let n = scored.len().max(1);
    let mae_days = scored
        .iter()
        .zip(predictions)
        .map(|(row, p)| (row.target_delta - p).abs())
        .sum::<f64>()
        / n as f64;
    let rmse_days = (scored
        .iter()
        .zip(predictions)
        .map(|(row, p)| (row.target_delta - p).powi(2))
        .sum::<f64>()
        / n as f64)
        .sqrt();
    TrainMetrics {
        mae_days,
        rmse_days,
        held_out_split: held_out as f64 / total.max(1) as f64,
    }
}
