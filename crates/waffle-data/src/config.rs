//! Configuration entry storage and change broadcasts backed by `PostgreSQL`.
//!
//! Every statement goes through the `waffle_config` stored procedures installed by
//! the bundled migrations so the table layout can evolve without touching callers.

use chrono::{DateTime, Utc};
use sqlx::{Executor, FromRow, PgPool, Postgres};
use tracing::debug;

use crate::error::{DataError, Result};

/// Default LISTEN/NOTIFY channel for configuration change stamps.
pub const DEFAULT_CHANNEL: &str = "waffleconf";

fn map_query_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> DataError {
    move |source| DataError::QueryFailed { operation, source }
}

/// Apply the configuration entry migrations.
///
/// # Errors
///
/// Returns an error when migration execution fails.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
        .run(pool)
        .await
        .map_err(|source| DataError::MigrationFailed { source })?;
    Ok(())
}

/// Raw projection of a `waffle_config.entry` row.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ConfigEntryRow {
    /// Unique configuration key.
    pub key: String,
    /// Codec-encoded value payload.
    pub value: String,
    /// Timestamp of the last write.
    pub updated_at: DateTime<Utc>,
}

/// Load a single entry by key.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn fetch_entry<'e, E>(executor: E, key: &str) -> Result<Option<ConfigEntryRow>>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, ConfigEntryRow>("SELECT * FROM waffle_config.fetch_entry(_key => $1)")
        .bind(key)
        .fetch_optional(executor)
        .await
        .map_err(map_query_err("fetch entry"))
}

/// Load every stored entry ordered by key.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn list_entries<'e, E>(executor: E) -> Result<Vec<ConfigEntryRow>>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, ConfigEntryRow>("SELECT * FROM waffle_config.list_entries()")
        .fetch_all(executor)
        .await
        .map_err(map_query_err("list entries"))
}

/// Insert or update an entry, returning the stored row.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub async fn upsert_entry<'e, E>(executor: E, key: &str, value: &str) -> Result<ConfigEntryRow>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, ConfigEntryRow>(
        "SELECT * FROM waffle_config.upsert_entry(_key => $1, _value => $2)",
    )
    .bind(key)
    .bind(value)
    .fetch_one(executor)
    .await
    .map_err(map_query_err("upsert entry"))
}

/// Remove an entry, returning the deleted row when it existed.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub async fn delete_entry<'e, E>(executor: E, key: &str) -> Result<Option<ConfigEntryRow>>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, ConfigEntryRow>("SELECT * FROM waffle_config.delete_entry(_key => $1)")
        .bind(key)
        .fetch_optional(executor)
        .await
        .map_err(map_query_err("delete entry"))
}

/// Broadcast a change payload on a LISTEN/NOTIFY channel.
///
/// # Errors
///
/// Returns an error if the notification cannot be issued.
pub async fn notify_change<'e, E>(executor: E, channel: &str, payload: &str) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    debug!(channel, payload, "issuing configuration change notification");
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(executor)
        .await
        .map_err(map_query_err("notify change"))?;
    Ok(())
}
