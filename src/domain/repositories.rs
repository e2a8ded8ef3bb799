//! Repository interfaces
//!
//! Contains trait definitions for data access patterns. Implementations live
//! in the infrastructure layer and must not leak backend-specific types.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::bulletin::{Bulletin, CategoryEntry, Chart, Country, SeriesPoint, VisaCategory};
use super::trend::{Forecast, ForecastKey};

/// Aggregate store statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub bulletin_count: i64,
    pub entry_count: i64,
    /// `(year, month)` of the earliest stored bulletin.
    pub earliest: Option<(i32, u32)>,
    /// `(year, month)` of the latest stored bulletin.
    pub latest: Option<(i32, u32)>,
    pub last_ingest_at: Option<DateTime<Utc>>,
}

/// Backend-agnostic store for bulletins, their entries and derived forecasts.
///
/// Writes to a single bulletin are atomic: either the bulletin row and all of
/// its child entries become visible together, or nothing changes. Re-running
/// a completed ingestion only bumps `updated_at` on touched rows.
#[async_trait]
pub trait BulletinRepository: Send + Sync {
    /// Insert or replace one bulletin and its entries in a single
    /// transaction. Child entries are replaced wholesale. Returns the
    /// bulletin id. `created_at` of an existing row is preserved.
    async fn upsert_bulletin(&self, bulletin: &Bulletin, entries: &[CategoryEntry]) -> Result<i64>;

    async fn get_bulletin(&self, year: i32, month: u32) -> Result<Option<Bulletin>>;

    /// Bulletins whose fiscal year falls in `[fy_from, fy_to]`, ordered by
    /// `(year, month)`.
    async fn list_bulletins(&self, fy_from: i32, fy_to: i32) -> Result<Vec<Bulletin>>;

    /// `(year, month)` pairs already present, for resume support.
    async fn existing_months(&self, fy_from: i32, fy_to: i32) -> Result<HashSet<(i32, u32)>>;

    /// All entries of one stored bulletin.
    async fn get_entries(&self, bulletin_id: i64) -> Result<Vec<CategoryEntry>>;

    /// Observations for one series, ascending by bulletin date.
    async fn get_series(
        &self,
        category: VisaCategory,
        country: Country,
        chart: Chart,
        fy_from: i32,
        fy_to: i32,
    ) -> Result<Vec<SeriesPoint>>;

    async fn get_stats(&self) -> Result<RepositoryStats>;

    async fn put_forecast(&self, forecast: &Forecast) -> Result<()>;

    async fn get_forecast(&self, key: &ForecastKey) -> Result<Option<Forecast>>;
}
