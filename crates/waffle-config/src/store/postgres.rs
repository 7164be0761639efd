//! `PostgreSQL` store built on the `waffle-data` stored procedures.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use waffle_data::config::{self, ConfigEntryRow};

use super::{ConfigRecord, ConfigStore};
use crate::error::{StoreError, StoreResult};

/// Autocommit store over the `waffle_config.entry` table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to `database_url` and apply the bundled migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connect`] when the pool cannot be established and
    /// [`StoreError::Data`] when migrations fail.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|source| StoreError::Connect { source })?;
        let store = Self::from_pool(pool).await?;
        info!("configuration store connected");
        Ok(store)
    }

    /// Wrap an existing pool, applying migrations first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Data`] when migrations fail.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        config::run_migrations(&pool)
            .await
            .map_err(|source| StoreError::Data { source })?;
        Ok(Self { pool })
    }

    /// Underlying pool, shared with the LISTEN/NOTIFY strategy.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_record(row: ConfigEntryRow) -> ConfigRecord {
    ConfigRecord {
        key: row.key,
        value: row.value,
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn get(&self, key: &str) -> StoreResult<Option<ConfigRecord>> {
        config::fetch_entry(&self.pool, key)
            .await
            .map(|row| row.map(to_record))
            .map_err(|source| StoreError::Data { source })
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<ConfigRecord> {
        config::upsert_entry(&self.pool, key, value)
            .await
            .map(to_record)
            .map_err(|source| StoreError::Data { source })
    }

    async fn delete(&self, key: &str) -> StoreResult<Option<ConfigRecord>> {
        config::delete_entry(&self.pool, key)
            .await
            .map(|row| row.map(to_record))
            .map_err(|source| StoreError::Data { source })
    }

    async fn commit(&self) -> StoreResult<()> {
        Ok(())
    }
}
