//! Storage backends
//!
//! Two implementations of the repository contract: an embedded SQLite store
//! for local use and a PostgreSQL store for server deployments. The backend
//! is chosen once at startup; callers only ever see the trait object.

pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::domain::repositories::BulletinRepository;
use crate::infrastructure::config::{StorageBackend, StorageConfig};

/// Bumped on every incompatible schema change. A store created by a
/// different version refuses to start instead of silently migrating.
pub const SCHEMA_VERSION: i32 = 1;

/// Build the configured repository implementation.
pub async fn make_repository(config: &StorageConfig) -> Result<Arc<dyn BulletinRepository>> {
    match config.backend {
        StorageBackend::Embedded => {
            let repo = sqlite::SqliteBulletinRepository::connect(&config.dsn)
                .await
                .context("failed to open embedded store")?;
            Ok(Arc::new(repo))
        }
        StorageBackend::Server => {
            let repo = postgres::PostgresBulletinRepository::connect(&config.dsn)
                .await
                .context("failed to connect to server store")?;
            Ok(Arc::new(repo))
        }
    }
}
