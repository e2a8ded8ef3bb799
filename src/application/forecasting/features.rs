//! Feature engineering for cutoff forecasting
//!
//! Features combine temporal context, recent trend statistics and the fixed
//! country/category demand scalars. The scalars are constants of the domain
//! model and are never adjusted by training.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::bulletin::{fiscal_year_for, Country, EntryStatus, SeriesPoint, VisaCategory};
use crate::domain::constants::{category_factor, country_factor};

/// Bumped whenever the feature layout changes. Saved into model artifacts;
/// loading across versions fails loudly.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub fiscal_year: f64,
    pub month_one_hot: [f64; 12],
    pub days_since_epoch: f64,
    pub mean_delta_3m: f64,
    pub mean_delta_12m: f64,
    pub volatility: f64,
    pub trend_ordinal: f64,
    pub seasonal_factor: f64,
    pub country_factor: f64,
    pub category_factor: f64,
    pub employment_indicator: f64,
}

impl FeatureVector {
    pub const DIM: usize = 21;

    /// Flattened layout consumed by the regressors.
    pub fn to_vec(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(Self::DIM);
        values.push(self.fiscal_year);
        values.extend_from_slice(&self.month_one_hot);
        values.push(self.days_since_epoch);
        values.push(self.mean_delta_3m);
        values.push(self.mean_delta_12m);
        values.push(self.volatility);
        values.push(self.trend_ordinal);
        values.push(self.seasonal_factor);
        values.push(self.country_factor);
        values.push(self.category_factor);
        values.push(self.employment_indicator);
        values
    }

    /// Stable digest of the canonical JSON encoding, used for staleness
    /// detection on stored forecasts.
    pub fn hash(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&json);
        format!("{digest:x}")
    }
}

/// One supervised example: features as of some month, target is the next
/// month's day delta.
#[derive(Debug, Clone)]
pub struct TrainingRow {
    pub features: FeatureVector,
    pub target_delta: f64,
}

/// Dated observations of a series as `(bulletin_date, cutoff)` pairs,
/// preserving repository order.
pub fn dated_observations(series: &[SeriesPoint]) -> Vec<(NaiveDate, NaiveDate)> {
    series
        .iter()
        .filter(|point| point.status == EntryStatus::Dated)
        .filter_map(|point| point.priority_date.map(|pd| (point.bulletin_date, pd)))
        .collect()
}

/// Features describing the state of the series after
/// `observations[..=as_of]`, aimed at `(target_year, target_month)`.
pub fn features_at(
    observations: &[(NaiveDate, NaiveDate)],
    as_of: usize,
    category: VisaCategory,
    country: Country,
    target_year: i32,
    target_month: u32,
) -> FeatureVector {
    let visible = if observations.is_empty() {
        observations
    } else {
        &observations[..=as_of.min(observations.len() - 1)]
    };
    let deltas: Vec<(u32, i64)> = visible
        .windows(2)
        .map(|pair| {
            let (_, previous) = pair[0];
            let (bulletin_date, cutoff) = pair[1];
            (bulletin_date.month(), (cutoff - previous).num_days())
        })
        .collect();
    let values: Vec<i64> = deltas.iter().map(|(_, d)| *d).collect();

    let mut month_one_hot = [0.0; 12];
    if (1..=12).contains(&target_month) {
        month_one_hot[(target_month - 1) as usize] = 1.0;
    }

    let last_cutoff = visible.last().map(|(_, c)| *c);
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch");
    let days_since_epoch = last_cutoff
        .map(|c| (c - epoch).num_days() as f64)
        .unwrap_or(0.0);

    FeatureVector {
        fiscal_year: f64::from(fiscal_year_for(target_year, target_month)),
        month_one_hot,
        days_since_epoch,
        mean_delta_3m: trailing_mean(&values, 3),
        mean_delta_12m: trailing_mean(&values, 12),
        volatility: population_stddev(&values),
        trend_ordinal: trend_ordinal(&values),
        seasonal_factor: seasonal_factor_for(&deltas, target_month),
        country_factor: country_factor(country),
        category_factor: category_factor(category),
        employment_indicator: if category.is_employment() { 1.0 } else { 0.0 },
    }
}

/// Build one training row per consecutive pair of dated observations.
pub fn training_rows(
    observations: &[(NaiveDate, NaiveDate)],
    category: VisaCategory,
    country: Country,
) -> Vec<TrainingRow> {
    let mut rows = Vec::new();
    for target_index in 1..observations.len() {
        let (target_date, target_cutoff) = observations[target_index];
        let (_, previous_cutoff) = observations[target_index - 1];
        let features = features_at(
            observations,
            target_index - 1,
            category,
            country,
            target_date.year(),
            target_date.month(),
        );
        rows.push(TrainingRow {
            features,
            target_delta: (target_cutoff - previous_cutoff).num_days() as f64,
        });
    }
    rows
}

fn trailing_mean(values: &[i64], window: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let tail = &values[values.len().saturating_sub(window)..];
    tail.iter().sum::<i64>() as f64 / tail.len() as f64
}

fn population_stddev(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<i64>() as f64 / values.len() as f64;
    let variance = values
        .iter()
        .map(|v| {
            let diff = *v as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / values.len() as f64;
    variance.sqrt()
}

fn trend_ordinal(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<i64>() as f64 / values.len() as f64;
    let non_negative = values.iter().filter(|v| **v >= 0).count() as f64 / values.len() as f64;
    let strictly_negative = values.iter().filter(|v| **v < 0).count() as f64 / values.len() as f64;
    if non_negative > 0.7 && mean > 5.0 {
        1.0
    } else if strictly_negative > 0.4 {
        -1.0
    } else {
        0.0
    }
}

/// Neutral factor of 1.0 when the target month has too little history.
fn seasonal_factor_for(deltas: &[(u32, i64)], target_month: u32) -> f64 {
    if deltas.is_empty() {
        return 1.0;
    }
    let overall_mean = deltas.iter().map(|(_, d)| *d).sum::<i64>() as f64 / deltas.len() as f64;
    if overall_mean == 0.0 {
        return 1.0;
    }
    let in_month: Vec<i64> = deltas
        .iter()
        .filter(|(m, _)| *m == target_month)
        .map(|(_, d)| *d)
        .collect();
    if in_month.len() < 2 {
        return 1.0;
    }
    let month_mean = in_month.iter().sum::<i64>() as f64 / in_month.len() as f64;
    month_mean / overall_mean
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observations(n: usize) -> Vec<(NaiveDate, NaiveDate)> {
        let mut out = Vec::new();
        let mut cutoff = NaiveDate::from_ymd_opt(2012, 1, 1).unwrap();
        for i in 0..n {
            let bulletin_date = NaiveDate::from_ymd_opt(2023, 1, 1)
                .unwrap()
                .checked_add_months(chrono::Months::new(i as u32))
                .unwrap();
            out.push((bulletin_date, cutoff));
            cutoff = cutoff + chrono::Duration::days(30);
        }
        out
    }

    #[test]
    fn feature_vector_has_declared_dimension() {
        let obs = observations(6);
        let features = features_at(&obs, 5, VisaCategory::Eb2, Country::India, 2023, 7);
        assert_eq!(features.to_vec().len(), FeatureVector::DIM);
    }

    #[test]
    fn country_and_category_scalars_are_fixed() {
        let obs = observations(6);
        let features = features_at(&obs, 5, VisaCategory::Eb2, Country::India, 2023, 7);
        assert_eq!(features.country_factor, 0.3);
        assert_eq!(features.employment_indicator, 1.0);

        let family = features_at(&obs, 5, VisaCategory::F4, Country::Worldwide, 2023, 7);
        assert_eq!(family.country_factor, 1.0);
        assert_eq!(family.employment_indicator, 0.0);
    }

    #[test]
    fn one_hot_marks_target_month() {
        let obs = observations(4);
        let features = features_at(&obs, 3, VisaCategory::Eb2, Country::China, 2023, 10);
        assert_eq!(features.month_one_hot[9], 1.0);
        assert_eq!(features.month_one_hot.iter().sum::<f64>(), 1.0);
        // October targets belong to the next fiscal year.
        assert_eq!(features.fiscal_year, 2024.0);
    }

    #[test]
    fn training_rows_pair_each_month_with_the_next_delta() {
        let obs = observations(5);
        let rows = training_rows(&obs, VisaCategory::Eb2, Country::India, );
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| (r.target_delta - 30.0).abs() < 1e-9));
        // Features for a row must not peek past its own month.
        assert!((rows[1].features.mean_delta_3m - 30.0).abs() < 1e-9);
    }

    #[test]
    fn hash_is_stable_and_input_sensitive() {
        let obs = observations(6);
        let a = features_at(&obs, 5, VisaCategory::Eb2, Country::India, 2023, 7);
        let b = features_at(&obs, 5, VisaCategory::Eb2, Country::India, 2023, 7);
        let c = features_at(&obs, 5, VisaCategory::Eb2, Country::India, 2023, 8);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash().len(), 64);
    }
}
