//! PostgreSQL server store
//!
//! Production backend. Mirrors the embedded store's semantics: one
//! transaction per bulletin, wholesale child replacement, explicit schema
//! version check at startup.

use std::collections::HashSet;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::domain::bulletin::{Bulletin, CategoryEntry, Chart, Country, EntryStatus, SeriesPoint, VisaCategory};
use crate::domain::repositories::{BulletinRepository, RepositoryStats};
use crate::domain::trend::{Forecast, ForecastKey};

use super::SCHEMA_VERSION;

const SCHEMA_SQL: &str = include_str!("../../../migrations/001_initial_schema_postgres.sql");

#[derive(Clone)]
pub struct PostgresBulletinRepository {
    pool: PgPool,
}

impl PostgresBulletinRepository {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await
            .context("failed to connect to postgres")?;

        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("failed to apply schema")?;

        let version: Option<i32> = sqlx::query_scalar("SELECT version FROM schema_meta")
            .fetch_optional(&pool)
            .await?;
        match version {
            None => {
                sqlx::query("INSERT INTO schema_meta (version) VALUES ($1)")
                    .bind(SCHEMA_VERSION)
                    .execute(&pool)
                    .await?;
                info!(version = SCHEMA_VERSION, "initialized server store schema");
            }
            Some(found) if found == SCHEMA_VERSION => {
                debug!(version = found, "server store schema verified");
            }
            Some(found) => {
                bail!("schema version mismatch: store has {found}, expected {SCHEMA_VERSION}")
            }
        }

        Ok(Self { pool })
    }
}

fn bulletin_from_row(row: &PgRow) -> Result<Bulletin> {
    Ok(Bulletin {
        id: Some(row.try_get::<i64, _>("id")?),
        year: row.try_get::<i32, _>("year")?,
        month: row.try_get::<i32, _>("month")? as u32,
        fiscal_year: row.try_get::<i32, _>("fiscal_year")?,
        bulletin_date: row.try_get::<NaiveDate, _>("bulletin_date")?,
        source_url: row.try_get("source_url")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<CategoryEntry> {
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
impl BulletinRepository for PostgresBulletinRepository {
    async fn upsert_bulletin(&self, bulletin: &Bulletin, entries: &[CategoryEntry]) -> Result<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent upserts of the same month on the unique
        // (year, month) constraint.
        let bulletin_id: i64 = sqlx::query_scalar(
            "INSERT INTO bulletins
             (year, month, fiscal_year, bulletin_date, source_url, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             ON CONFLICT (year, month) DO UPDATE
             SET fiscal_year = EXCLUDED.fiscal_year,
                 bulletin_date = EXCLUDED.bulletin_date,
                 source_url = EXCLUDED.source_url,
                 updated_at = EXCLUDED.updated_at
             RETURNING id",
        )
        .bind(bulletin.year)
        .bind(bulletin.month as i32)
        .bind(bulletin.fiscal_year)
        .bind(bulletin.bulletin_date)
        .bind(&bulletin.source_url)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM category_entries WHERE bulletin_id = $1")
            .bind(bulletin_id)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                "INSERT INTO category_entries
                 (bulletin_id, category, country, chart, status, priority_date, notes)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
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
             FROM bulletins WHERE year = $1 AND month = $2",
        )
        .bind(year)
        .bind(month as i32)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(bulletin_from_row).transpose()
    }

    async fn list_bulletins(&self, fy_from: i32, fy_to: i32) -> Result<Vec<Bulletin>> {
        let rows = sqlx::query(
            "SELECT id, year, month, fiscal_year, bulletin_date, source_url, created_at, updated_at
             FROM bulletins WHERE fiscal_year BETWEEN $1 AND $2
             ORDER BY year, month",
        )
        .bind(fy_from)
        .bind(fy_to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bulletin_from_row).collect()
    }

    async fn existing_months(&self, fy_from: i32, fy_to: i32) -> Result<HashSet<(i32, u32)>> {
        let rows = sqlx::query(
            "SELECT year, month FROM bulletins WHERE fiscal_year BETWEEN $1 AND $2",
        )
        .bind(fy_from)
        .bind(fy_to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<i32, _>("year")?,
                    row.try_get::<i32, _>("month")? as u32,
                ))
            })
            .collect()
    }

    async fn get_entries(&self, bulletin_id: i64) -> Result<Vec<CategoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, bulletin_id, category, country, chart, status, priority_date, notes
             FROM category_entries WHERE bulletin_id = $1
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
             WHERE e.category = $1 AND e.country = $2 AND e.chart = $3
               AND b.fiscal_year BETWEEN $4 AND $5
             ORDER BY b.year, b.month",
        )
        .bind(category.as_str())
        .bind(country.as_str())
        .bind(chart.as_str())
        .bind(fy_from)
        .bind(fy_to)
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

        let month_of = |row: &PgRow| -> Result<(i32, u32)> {
            Ok((
                row.try_get::<i32, _>("year")?,
                row.try_get::<i32, _>("month")? as u32,
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
            "INSERT INTO forecasts
             (category, country, chart, target_year, target_month,
              predicted_date, confidence, model_id, produced_at, features_hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (category, country, chart, target_year, target_month) DO UPDATE
             SET predicted_date = EXCLUDED.predicted_date,
                 confidence = EXCLUDED.confidence,
                 model_id = EXCLUDED.model_id,
                 produced_at = EXCLUDED.produced_at,
                 features_hash = EXCLUDED.features_hash",
        )
        .bind(forecast.key.category.as_str())
        .bind(forecast.key.country.as_str())
        .bind(forecast.key.chart.as_str())
        .bind(forecast.key.target_year)
        .bind(forecast.key.target_month as i32)
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
             WHERE category = $1 AND country = $2 AND chart = $3
               AND target_year = $4 AND target_month = $5",
        )
        .bind(key.category.as_str())
        .bind(key.country.as_str())
        .bind(key.chart.as_str())
        .bind(key.target_year)
        .bind(key.target_month as i32)
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
