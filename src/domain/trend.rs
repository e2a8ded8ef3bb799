//! Derived analytics types: trend summaries and forecasts.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::bulletin::{Chart, Country, VisaCategory};

/// Overall direction of a cutoff series over an analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Advancing,
    Stable,
    Retrogressing,
    Mixed,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Advancing => "ADVANCING",
            TrendDirection::Stable => "STABLE",
            TrendDirection::Retrogressing => "RETROGRESSING",
            TrendDirection::Mixed => "MIXED",
        }
    }

    /// Ordinal encoding used as a model feature.
    pub fn ordinal(&self) -> f64 {
        match self {
            TrendDirection::Advancing => 1.0,
            TrendDirection::Stable => 0.0,
            TrendDirection::Mixed => 0.0,
            TrendDirection::Retrogressing => -1.0,
        }
    }
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Momentum of recent movement compared with the preceding stretch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Momentum {
    pub recent_mean_days: f64,
    pub earlier_mean_days: f64,
    pub change_days: f64,
}

/// Cached trend statistics for one `(category, country, chart)` series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub category: VisaCategory,
    pub country: Country,
    pub chart: Chart,
    pub window_months: u32,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub observations: usize,
    pub total_advancement_days: i64,
    pub mean_monthly_days: f64,
    pub volatility: f64,
    pub trend_direction: TrendDirection,
    /// Per-month seasonal factor, index 0 is January. `None` where fewer
    /// than two observations fall in that month.
    pub seasonal_factors: [Option<f64>; 12],
    pub momentum: Option<Momentum>,
}

impl TrendSummary {
    /// The zero summary returned for series with no dated observations.
    pub fn empty(category: VisaCategory, country: Country, chart: Chart, window_months: u32) -> Self {
        Self {
            category,
            country,
            chart,
            window_months,
            start_date: None,
            end_date: None,
            observations: 0,
            total_advancement_days: 0,
            mean_monthly_days: 0.0,
            volatility: 0.0,
            trend_direction: TrendDirection::Stable,
            seasonal_factors: [None; 12],
            momentum: None,
        }
    }
}

/// Identity of a forecast row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForecastKey {
    pub category: VisaCategory,
    pub country: Country,
    pub chart: Chart,
    pub target_year: i32,
    pub target_month: u32,
}

/// A stored prediction for one target month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub key: ForecastKey,
    pub predicted_date: Option<NaiveDate>,
    pub confidence: f64,
    pub model_id: String,
    pub produced_at: DateTime<Utc>,
    pub features_hash: String,
}

/// Identifier reported when a series is too short for a trained model.
pub const NULL_FORECASTER_ID: &str = "null-forecaster";
