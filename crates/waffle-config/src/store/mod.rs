//! Persistent key/value record storage.
//!
//! # Design
//! - Missing keys are `None`, never errors.
//! - The orchestrator calls [`ConfigStore::commit`] once after every mutating batch;
//!   autocommit backends treat it as a no-op.

mod file;
mod memory;
mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Stored configuration record; `value` is always codec-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// Unique configuration key.
    pub key: String,
    /// Codec-encoded payload.
    pub value: String,
}

impl ConfigRecord {
    /// Build a record from borrowed parts.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Contract every configuration backend fulfils.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load the record stored under `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<ConfigRecord>>;

    /// Insert or replace the record stored under `key`.
    async fn put(&self, key: &str, value: &str) -> StoreResult<ConfigRecord>;

    /// Remove the record stored under `key`, returning it when present.
    async fn delete(&self, key: &str) -> StoreResult<Option<ConfigRecord>>;

    /// Make pending writes durable and visible to other processes.
    async fn commit(&self) -> StoreResult<()>;
}
