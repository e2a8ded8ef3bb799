//! Trend analytics over stored cutoff series
//!
//! Works on repository output only; never touches the network. Dated
//! observations are reduced to month-over-month day deltas, from which the
//! summary statistics and the trend classification are derived.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, Months, NaiveDate};
use tokio::task::JoinSet;
use tracing::debug;

use crate::domain::bulletin::{Chart, Country, EntryStatus, VisaCategory};
use crate::domain::constants::{FY_CEILING, FY_FLOOR};
use crate::domain::repositories::BulletinRepository;
use crate::domain::trend::{Momentum, TrendDirection, TrendSummary};

#[derive(Clone)]
pub struct TrendAnalyzer {
    repo: Arc<dyn BulletinRepository>,
}

impl TrendAnalyzer {
    pub fn new(repo: Arc<dyn BulletinRepository>) -> Self {
        Self { repo }
    }

    /// Summarize one series over the trailing `window_months` months.
    /// `window_months = 0` means the whole history. Never errors on short
    /// or empty series.
    pub async fn analyze_series(
        &self,
        category: VisaCategory,
        country: Country,
        chart: Chart,
        window_months: u32,
    ) -> Result<TrendSummary> {
        let series = self
            .repo
            .get_series(category, country, chart, FY_FLOOR, FY_CEILING)
            .await?;

        let mut observations: Vec<(NaiveDate, NaiveDate)> = series
            .iter()
            .filter(|point| point.status == EntryStatus::Dated)
            .filter_map(|point| point.priority_date.map(|pd| (point.bulletin_date, pd)))
            .collect();

        if window_months > 0 {
            if let Some(&(last_date, _)) = observations.last() {
                let cutoff = last_date
                    .checked_sub_months(Months::new(window_months))
                    .unwrap_or(last_date);
                observations.retain(|(bulletin_date, _)| *bulletin_date >= cutoff);
            }
        }

        if observations.is_empty() {
            return Ok(TrendSummary::empty(category, country, chart, window_months));
        }

        let start_date = observations.first().map(|(d, _)| *d);
        let end_date = observations.last().map(|(d, _)| *d);

        // Month-over-month movement of the cutoff, labelled with the month
        // of the later bulletin.
        let mut deltas: Vec<(u32, i64)> = Vec::with_capacity(observations.len().saturating_sub(1));
        for pair in observations.windows(2) {
            let (_, previous_cutoff) = pair[0];
            let (bulletin_date, cutoff) = pair[1];
            deltas.push((bulletin_date.month(), (cutoff - previous_cutoff).num_days()));
        }

        let values: Vec<i64> = deltas.iter().map(|(_, d)| *d).collect();
        let total_advancement_days: i64 = values.iter().sum();
        let mean_monthly_days = if values.is_empty() {
            0.0
        } else {
            total_advancement_days as f64 / values.len() as f64
        };
        let volatility = population_stddev(&values);
        let trend_direction = classify_trend(&values, mean_monthly_days, volatility);
        let seasonal_factors = seasonal_factors(&deltas, mean_monthly_days);
        let momentum = momentum(&values);

        debug!(
            %category, %country, %chart,
            observations = observations.len(),
            mean = mean_monthly_days,
            volatility,
            direction = %trend_direction,
            "series analyzed"
        );

        Ok(TrendSummary {
            category,
            country,
            chart,
            window_months,
            start_date,
            end_date,
            observations: observations.len(),
            total_advancement_days,
            mean_monthly_days,
            volatility,
            trend_direction,
            seasonal_factors,
            momentum,
        })
    }

    /// Analyze several series concurrently, preserving input order.
    pub async fn compare_categories(
        &self,
        keys: &[(VisaCategory, Country, Chart)],
        window_months: u32,
    ) -> Result<Vec<TrendSummary>> {
        let mut join_set = JoinSet::new();
        for (index, &(category, country, chart)) in keys.iter().enumerate() {
            let analyzer = self.clone();
            join_set.spawn(async move {
                let summary = analyzer
                    .analyze_series(category, country, chart, window_months)
                    .await;
                (index, summary)
            });
        }

        let mut summaries: Vec<Option<TrendSummary>> = vec![None; keys.len()];
        while let Some(joined) = join_set.join_next().await {
            let (index, summary) = joined?;
            summaries[index] = Some(summary?);
        }
        Ok(summaries.into_iter().flatten().collect())
    }
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

fn classify_trend(deltas: &[i64], mean: f64, volatility: f64) -> TrendDirection {
    if deltas.is_empty() {
        return TrendDirection::Stable;
    }
    let non_negative = deltas.iter().filter(|d| **d >= 0).count() as f64 / deltas.len() as f64;
    let strictly_negative = deltas.iter().filter(|d| **d < 0).count() as f64 / deltas.len() as f64;

    if non_negative > 0.7 && mean > 5.0 {
        TrendDirection::Advancing
    } else if strictly_negative > 0.4 {
        TrendDirection::Retrogressing
    } else if mean.abs() <= 5.0 && volatility < 10.0 {
        TrendDirection::Stable
    } else {
        TrendDirection::Mixed
    }
}

/// Ratio of each month's mean delta to the overall mean. Months with fewer
/// than two observations stay undefined.
fn seasonal_factors(deltas: &[(u32, i64)], overall_mean: f64) -> [Option<f64>; 12] {
    let mut factors: [Option<f64>; 12] = [None; 12];
    if overall_mean == 0.0 {
        return factors;
    }
    for month in 1..=12u32 {
        let in_month: Vec<i64> = deltas
            .iter()
            .filter(|(m, _)| *m == month)
            .map(|(_, d)| *d)
            .collect();
        if in_month.len() >= 2 {
            let month_mean = in_month.iter().sum::<i64>() as f64 / in_month.len() as f64;
            factors[(month - 1) as usize] = Some(month_mean / overall_mean);
        }
    }
    factors
}

/// Mean of the last six deltas against the stretch before them.
fn momentum(deltas: &[i64]) -> Option<Momentum> {
    if deltas.len() < 7 {
        return None;
    }
    let (earlier, recent) = deltas.split_at(deltas.len() - 6);
    let earlier = &earlier[earlier.len().saturating_sub(6)..];
    let recent_mean = recent.iter().sum::<i64>() as f64 / recent.len() as f64;
    let earlier_mean = earlier.iter().sum::<i64>() as f64 / earlier.len() as f64;
    Some(Momentum {
        recent_mean_days: recent_mean,
        earlier_mean_days: earlier_mean,
        change_days: recent_mean - earlier_mean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bulletin::{Bulletin, CategoryEntry};
    use crate::infrastructure::repository::sqlite::SqliteBulletinRepository;
    use tempfile::tempdir;

    async fn repo_with_monthly_deltas(
        dir: &tempfile::TempDir,
        deltas: &[i64],
    ) -> Arc<dyn BulletinRepository> {
        let dsn = format!("sqlite:{}", dir.path().join("trend.db").display());
        let repo = SqliteBulletinRepository::connect(&dsn).await.unwrap();

        // One observation per month starting January 2023, cutoffs walking
        // through the requested deltas.
        let mut cutoff = NaiveDate::from_ymd_opt(2012, 1, 1).unwrap();
        let mut bulletin_date = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        for (i, delta) in std::iter::once(&0i64).chain(deltas.iter()).enumerate() {
            cutoff = cutoff + chrono::Duration::days(*delta);
            let bulletin = Bulletin::new(
                bulletin_date.year(),
                bulletin_date.month(),
                bulletin_date,
                format!("https://example.gov/{i}.html"),
            );
            let entries = vec![CategoryEntry::new(
                VisaCategory::Eb2,
                Country::India,
                Chart::FinalAction,
                EntryStatus::Dated,
                Some(cutoff),
            )];
            repo.upsert_bulletin(&bulletin, &entries).await.unwrap();
            bulletin_date = bulletin_date
                .checked_add_months(Months::new(1))
                .unwrap();
        }
        Arc::new(repo)
    }

    #[tokio::test]
    async fn steady_positive_deltas_classify_as_advancing() {
        let dir = tempdir().unwrap();
        let deltas = [30, 45, 20, 30, 40, 35, 25, 30, 40, 50, 30, 25];
        let repo = repo_with_monthly_deltas(&dir, &deltas).await;
        let analyzer = TrendAnalyzer::new(repo);

        let summary = analyzer
            .analyze_series(VisaCategory::Eb2, Country::India, Chart::FinalAction, 0)
            .await
            .unwrap();

        assert_eq!(summary.observations, 13);
        assert_eq!(summary.trend_direction, TrendDirection::Advancing);
        assert_eq!(summary.total_advancement_days, deltas.iter().sum::<i64>());
        assert!((summary.mean_monthly_days - 33.333).abs() < 0.01);
        assert!(summary.volatility > 8.0 && summary.volatility < 10.0);
    }

    #[tokio::test]
    async fn empty_series_returns_zeroes_not_errors() {
        let dir = tempdir().unwrap();
        let repo = repo_with_monthly_deltas(&dir, &[]).await;
        let analyzer = TrendAnalyzer::new(repo);

        // A series that was never stored at all.
        let summary = analyzer
            .analyze_series(VisaCategory::F4, Country::Mexico, Chart::FinalAction, 24)
            .await
            .unwrap();
        assert_eq!(summary.observations, 0);
        assert_eq!(summary.trend_direction, TrendDirection::Stable);
        assert_eq!(summary.total_advancement_days, 0);
        assert_eq!(summary.mean_monthly_days, 0.0);
        assert_eq!(summary.volatility, 0.0);
        assert!(summary.seasonal_factors.iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn retrogression_is_flagged() {
        let dir = tempdir().unwrap();
        let deltas = [-30, -10, 20, -45, -15, 10, -20, -25];
        let repo = repo_with_monthly_deltas(&dir, &deltas).await;
        let analyzer = TrendAnalyzer::new(repo);

        let summary = analyzer
            .analyze_series(VisaCategory::Eb2, Country::India, Chart::FinalAction, 0)
            .await
            .unwrap();
        assert_eq!(summary.trend_direction, TrendDirection::Retrogressing);
    }

    #[tokio::test]
    async fn flat_series_is_stable() {
        let dir = tempdir().unwrap();
        let deltas = [0, 1, -1, 0, 2, 0, -2, 1];
        let repo = repo_with_monthly_deltas(&dir, &deltas).await;
        let analyzer = TrendAnalyzer::new(repo);

        let summary = analyzer
            .analyze_series(VisaCategory::Eb2, Country::India, Chart::FinalAction, 0)
            .await
            .unwrap();
        assert_eq!(summary.trend_direction, TrendDirection::Stable);
    }

    #[tokio::test]
    async fn compare_preserves_key_order() {
        let dir = tempdir().unwrap();
        let repo = repo_with_monthly_deltas(&dir, &[10, 10, 10]).await;
        let analyzer = TrendAnalyzer::new(repo);

        let keys = vec![
            (VisaCategory::F1, Country::Mexico, Chart::FinalAction),
            (VisaCategory::Eb2, Country::India, Chart::FinalAction),
        ];
        let summaries = analyzer.compare_categories(&keys, 0).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].category, VisaCategory::F1);
        assert_eq!(summaries[0].observations, 0);
        assert_eq!(summaries[1].category, VisaCategory::Eb2);
        assert_eq!(summaries[1].observations, 4);
    }

    #[test]
    fn seasonal_factor_needs_two_observations_per_month() {
        let deltas = vec![(1, 30), (1, 10), (2, 20)];
        let factors = seasonal_factors(&deltas, 20.0);
        assert_eq!(factors[0], Some(1.0));
        assert_eq!(factors[1], None);
    }
}
