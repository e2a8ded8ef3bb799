//! Core domain model for visa bulletin data
//!
//! Contains the canonical entities, closed enums for categories, countries
//! and charts, derived analytics types and the repository contract.

pub mod bulletin;
pub mod constants;
pub mod repositories;
pub mod trend;

pub use bulletin::{
    Bulletin, CategoryEntry, Chart, Country, EntryStatus, SeriesPoint, VisaCategory,
};
pub use repositories::{BulletinRepository, RepositoryStats};
pub use trend::{Forecast, ForecastKey, Momentum, TrendDirection, TrendSummary};
