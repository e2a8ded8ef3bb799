//! Embedded SQLite store
//!
//! Single-file backend used for local and development runs. All writes to a
//! bulletin happen inside one transaction; re-ingesting the same month
//! preserves `created_at` and replaces child entries wholesale.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::domain::bulletin::{Bulletin, CategoryEntry, Chart, Country, EntryStatus, SeriesPoint, VisaCategory};
use crate::domain::repositories::{BulletinRepository, RepositoryStats};
use crate::domain::trend::{Forecast, ForecastKey};

use super::SCHEMA_VERSION;

const SCHEMA_SQL: &str = include_str!("../../../migrations/001_initial_schema_sqlite.sql");

#[derive(Clone, Debug)]
pub struct SqliteBulletinRepository {
    pool: SqlitePool,
}

impl SqliteBulletinRepository {
    /// Open (creating if necessary) the database file and verify the schema
    /// version. A mismatched version is a startup failure, never a silent
    /// migration.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let db_path = dsn
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");

        if db_path != ":memory:" {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
            }
            if !Path::new(db_path).exists() {
                std::fs::File::create(db_path)
                    .with_context(|| format!("failed to create {db_path}"))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await
            .with_context(|| format!("failed to open sqlite database at {db_path}"))?;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("failed to apply schema")?;

        let version: Option<i32> = sqlx::query_scalar("SELECT version FROM schema_meta")
            .fetch_optional(&pool)
            .await?;
        match version {
            None => {
                sqlx::query("INSERT INTO schema_meta (version) VALUES (?)")
                    .bind(SCHEMA_VERSION)
                    .execute(&pool)
                    .await?;
                info!(version = SCHEMA_VERSION, "initialized embedded store schema");
            }
            Some(found) if found == SCHEMA_VERSION => {
                debug!(version = found, "embedded store schema verified");
            }
            Some(found) => {
                bail!("schema version mismatch: store has {found}, expected {SCHEMA_VERSION}")
            }
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn bulletin_from_row(row: &SqliteRow) -> Result<Bulletin> {
    Ok(Bulletin {
        id: Some(row.try_get::<i64, _>("id")?),
        year: row.try_get::<i64, _>("year")? as i32,
        month: row.try_get::<i64, _>("month")? as u32,
        fiscal_year: row.try_get::<i64, _>("fiscal_year")? as i32,
        bulletin_date: row.try_get::<NaiveDate, _>("bulletin_date")?,
        source_url: row.try_get("source_url")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<CategoryEntry> {
    let category: String = row.try_get("category")?;
    let country: String = row.try_get("country")?;
    let chart: String = row.try_get("chart")?;
    let status: String = row.try_get("status")?;
    Ok(CategoryEntry {
        id: Some(row.try_get::<i64, _>("id")?),
        bulletin_id: Some(row.try_get::<i64, _>("bulletin_id")?),
        category: VisaCategory::from_code(&category)
            .ok_or_else(|| anyhow!("unknown stored category '{category}'"))?,
        country: Country::from_code(&country)
            .ok_or_else(|| anyhow!("unknown stored country '{country}'"))?,
        chart: Chart::from_code(&chart).ok_or_else(|| anyhow!("unknown stored chart '{chart}'"))?,
        status: EntryStatus::from_code(&status)
            .ok_or_else(|| anyhow!("unknown stored status '{status}'"))?,
        priority_date: row.try_get::<Option<NaiveDate>, _>("priority_date")?,
        notes: row.try_get("notes")?,
    })
}

#[async_trait]
impl BulletinRepository for SqliteBulletinRepository {
    async fn upsert_bulletin(&self, bulletin: &Bulletin, entries: &[CategoryEntry]) -> Result<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT id FROM bulletins WHERE year = ? AND month = ?")
            .bind(i64::from(bulletin.year))
            .bind(i64::from(bulletin.month))
            .fetch_optional(&mut *tx)
            .await?;

        let bulletin_id = match existing {
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                sqlx::query(
                    "UPDATE bulletins
                     SET fiscal_year = ?, bulletin_date = ?, source_url = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(i64::from(bulletin.fiscal_year))
                .bind(bulletin.bulletin_date)
                .bind(&bulletin.source_url)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO bulletins
                     (year, month, fiscal_year, bulletin_date, source_url, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(i64::from(bulletin.year))
                .bind(i64::from(bulletin.month))
                .bind(i64::from(bulletin.fiscal_year))
                .bind(bulletin.bulletin_date)
                .bind(&bulletin.source_url)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                result.last_insert_rowid()
            }
        };

        sqlx::query("DELETE FROM category_entries WHERE bulletin_id = ?")
            .bind(bulletin_id)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                "INSERT INTO category_entries
                 (bulletin_id, category, country, chart, status, priority_date, notes)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(bulletin_id)
            .bind(entry.category.as_str())
            .bind(entry.country.as_str())
            .bind(entry.chart.as_str())
            .bind(entry.status.as_str())
            .bind(entry.priority_date)
            .bind(&entry.notes)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(bulletin_id)
    }

    async fn get_bulletin(&self, year: i32, month: u32) -> Result<Option<Bulletin>> {
        let row = sqlx::query(
            "SELECT id, year, month, fiscal_year, bulletin_date, source_url, created_at, updated_at
             FROM bulletins WHERE year = ? AND month = ?",
        )
        .bind(i64::from(year))
        .bind(i64::from(month))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(bulletin_from_row).transpose()
    }

    async fn list_bulletins(&self, fy_from: i32, fy_to: i32) -> Result<Vec<Bulletin>> {
        let rows = sqlx::query(
            "SELECT id, year, month, fiscal_year, bulletin_date, source_url, created_at, updated_at
             FROM bulletins WHERE fiscal_year BETWEEN ? AND ?
             ORDER BY year, month",
        )
        .bind(i64::from(fy_from))
        .bind(i64::from(fy_to))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bulletin_from_row).collect()
    }

    async fn existing_months(&self, fy_from: i32, fy_to: i32) -> Result<HashSet<(i32, u32)>> {
        let rows = sqlx::query(
            "SELECT year, month FROM bulletins WHERE fiscal_year BETWEEN ? AND ?",
        )
        .bind(i64::from(fy_from))
        .bind(i64::from(fy_to))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<i64, _>("year")? as i32,
                    row.try_get::<i64, _>("month")? as u32,
                ))
            })
            .collect()
    }

    async fn get_entries(&self, bulletin_id: i64) -> Result<Vec<CategoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, bulletin_id, category, country, chart, status, priority_date, notes
             FROM category_entries WHERE bulletin_id = ?
             ORDER BY category, country, chart",
        )
        .bind(bulletin_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn get_series(
        &self,
        category: VisaCategory,
        country: Country,
        chart: Chart,
        fy_from: i32,
        fy_to: i32,
    ) -> Result<Vec<SeriesPoint>> {
        let rows = sqlx::query(
            "SELECT b.bulletin_date AS bulletin_date, e.status AS status,
                    e.priority_date AS priority_date
             FROM category_entries e
             JOIN bulletins b ON b.id = e.bulletin_id
             WHERE e.category = ? AND e.country = ? AND e.chart = ?
               AND b.fiscal_year BETWEEN ? AND ?
             ORDER BY b.year, b.month",
        )
        .bind(category.as_str())
        .bind(country.as_str())
        .bind(chart.as_str())
        .bind(i64::from(fy_from))
        .bind(i64::from(fy_to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(SeriesPoint {
                    bulletin_date: row.try_get("bulletin_date")?,
                    status: EntryStatus::from_code(&status)
                        .ok_or_else(|| anyhow!("unknown stored status '{status}'"))?,
                    priority_date: row.try_get("priority_date")?,
                })
            })
            .collect()
    }

    async fn get_stats(&self) -> Result<RepositoryStats> {
        let bulletin_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bulletins")
            .fetch_one(&self.pool)
            .await?;
        let entry_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM category_entries")
            .fetch_one(&self.pool)
            .await?;
        let earliest = sqlx::query(
            "SELECT year, month FROM bulletins ORDER BY year, month LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let latest = sqlx::query(
            "SELECT year, month FROM bulletins ORDER BY year DESC, month DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let last_ingest_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(updated_at) FROM bulletins")
                .fetch_one(&self.pool)
                .await?;

        let month_of = |row: &SqliteRow| -> Result<(i32, u32)> {
            Ok((
                row.try_get::<i64, _>("year")? as i32,
                row.try_get::<i64, _>("month")? as u32,
            ))
        };

        Ok(RepositoryStats {
            bulletin_count,
            entry_count,
            earliest: earliest.as_ref().map(month_of).transpose()?,
            latest: latest.as_ref().map(month_of).transpose()?,
            last_ingest_at,
        })
    }

    async fn put_forecast(&self, forecast: &Forecast) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO forecasts
             (category, country, chart, target_year, target_month,
              predicted_date, confidence, model_id, produced_at, features_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(forecast.key.category.as_str())
        .bind(forecast.key.country.as_str())
        .bind(forecast.key.chart.as_str())
        .bind(i64::from(forecast.key.target_year))
        .bind(i64::from(forecast.key.target_month))
        .bind(forecast.predicted_date)
        .bind(forecast.confidence)
        .bind(&forecast.model_id)
        .bind(forecast.produced_at)
        .bind(&forecast.features_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_forecast(&self, key: &ForecastKey) -> Result<Option<Forecast>> {
        let row = sqlx::query(
            "SELECT predicted_date, confidence, model_id, produced_at, features_hash
             FROM forecasts
             WHERE category = ? AND country = ? AND chart = ?
               AND target_year = ? AND target_month = ?",
        )
        .bind(key.category.as_str())
        .bind(key.country.as_str())
        .bind(key.chart.as_str())
        .bind(i64::from(key.target_year))
        .bind(i64::from(key.target_month))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Forecast {
                key: *key,
                predicted_date: row.try_get("predicted_date")?,
                confidence: row.try_get("confidence")?,
                model_id: row.try_get("model_id")?,
                produced_at: row.try_get("produced_at")?,
                features_hash: row.try_get("features_hash")?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_bulletin(year: i32, month: u32) -> Bulletin {
        Bulletin::new(
            year,
            month,
            NaiveDate::from_ymd_opt(year, month, 1).unwrap(),
            format!("https://example.gov/{year}-{month}.html"),
        )
    }

    fn sample_entries() -> Vec<CategoryEntry> {
        vec![
            CategoryEntry::new(
                VisaCategory::Eb2,
                Country::India,
                Chart::FinalAction,
                EntryStatus::Dated,
                NaiveDate::from_ymd_opt(2012, 1, 1),
            ),
            CategoryEntry::new(
                VisaCategory::Eb2,
                Country::Worldwide,
                Chart::FinalAction,
                EntryStatus::Current,
                None,
            ),
        ]
    }

    async fn open_repo(dir: &tempfile::TempDir) -> SqliteBulletinRepository {
        let db_path = dir.path().join("visa.db");
        let dsn = format!("sqlite:{}", db_path.display());
        SqliteBulletinRepository::connect(&dsn).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_and_read_back() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir).await;

        let id = repo
            .upsert_bulletin(&sample_bulletin(2023, 3), &sample_entries())
            .await
            .unwrap();
        let stored = repo.get_bulletin(2023, 3).await.unwrap().unwrap();
        assert_eq!(stored.id, Some(id));
        assert_eq!(stored.fiscal_year, 2023);

        let entries = repo.get_entries(id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.bulletin_id == Some(id)));
    }

    #[tokio::test]
    async fn reingest_is_idempotent_and_preserves_created_at() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir).await;

        let bulletin = sample_bulletin(2023, 3);
        let entries = sample_entries();
        let first_id = repo.upsert_bulletin(&bulletin, &entries).await.unwrap();
        let first = repo.get_bulletin(2023, 3).await.unwrap().unwrap();

        let second_id = repo.upsert_bulletin(&bulletin, &entries).await.unwrap();
        let second = repo.get_bulletin(2023, 3).await.unwrap().unwrap();

        assert_eq!(first_id, second_id);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.bulletin_count, 1);
        assert_eq!(stats.entry_count, 2);
    }

    #[tokio::test]
    async fn child_entries_are_replaced_wholesale() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir).await;

        let bulletin = sample_bulletin(2023, 3);
        let id = repo
            .upsert_bulletin(&bulletin, &sample_entries())
            .await
            .unwrap();

        let replacement = vec![CategoryEntry::new(
            VisaCategory::F1,
            Country::Mexico,
            Chart::DatesForFiling,
            EntryStatus::Dated,
            NaiveDate::from_ymd_opt(2001, 3, 1),
        )];
        repo.upsert_bulletin(&bulletin, &replacement).await.unwrap();

        let entries = repo.get_entries(id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].category, VisaCategory::F1);
    }

    #[tokio::test]
    async fn series_is_ordered_and_free_of_duplicates() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir).await;

        // Insert out of order on purpose.
        for (year, month, day) in [(2023, 5, 15), (2023, 3, 1), (2023, 4, 8)] {
            let bulletin = sample_bulletin(year, month);
            let entries = vec![CategoryEntry::new(
                VisaCategory::Eb2,
                Country::India,
                Chart::FinalAction,
                EntryStatus::Dated,
                NaiveDate::from_ymd_opt(2012, month, day),
            )];
            repo.upsert_bulletin(&bulletin, &entries).await.unwrap();
        }

        let series = repo
            .get_series(VisaCategory::Eb2, Country::India, Chart::FinalAction, 2023, 2023)
            .await
            .unwrap();
        assert_eq!(series.len(), 3);
        let dates: Vec<NaiveDate> = series.iter().map(|p| p.bulletin_date).collect();
        let mut sorted = dates.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(dates, sorted);
    }

    #[tokio::test]
    async fn fiscal_year_filter_applies_to_listing() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir).await;

        // October 2023 belongs to FY2024, September 2023 to FY2023.
        repo.upsert_bulletin(&sample_bulletin(2023, 9), &sample_entries())
            .await
            .unwrap();
        repo.upsert_bulletin(&sample_bulletin(2023, 10), &sample_entries())
            .await
            .unwrap();

        let fy2024 = repo.list_bulletins(2024, 2024).await.unwrap();
        assert_eq!(fy2024.len(), 1);
        assert_eq!((fy2024[0].year, fy2024[0].month), (2023, 10));

        let months = repo.existing_months(2023, 2024).await.unwrap();
        assert!(months.contains(&(2023, 9)));
        assert!(months.contains(&(2023, 10)));
    }

    #[tokio::test]
    async fn forecast_round_trip() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir).await;

        let key = ForecastKey {
            category: VisaCategory::Eb2,
            country: Country::India,
            chart: Chart::FinalAction,
            target_year: 2026,
            target_month: 9,
        };
        let forecast = Forecast {
            key,
            predicted_date: NaiveDate::from_ymd_opt(2012, 7, 15),
            confidence: 0.62,
            model_id: "stump-ensemble-v1".to_string(),
            produced_at: Utc::now(),
            features_hash: "abc123".to_string(),
        };
        repo.put_forecast(&forecast).await.unwrap();

        let stored = repo.get_forecast(&key).await.unwrap().unwrap();
        assert_eq!(stored.predicted_date, forecast.predicted_date);
        assert_eq!(stored.model_id, "stump-ensemble-v1");
        assert!((stored.confidence - 0.62).abs() < 1e-9);

        assert!(repo
            .get_forecast(&ForecastKey {
                target_month: 10,
                ..key
            })
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn schema_version_mismatch_fails_startup() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("visa.db");
        let dsn = format!("sqlite:{}", db_path.display());

        let repo = SqliteBulletinRepository::connect(&dsn).await.unwrap();
        sqlx::query("UPDATE schema_meta SET version = 99")
            .execute(repo.pool())
            .await
            .unwrap();
        drop(repo);

        let result = SqliteBulletinRepository::connect(&dsn).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("schema version"));
    }
}
