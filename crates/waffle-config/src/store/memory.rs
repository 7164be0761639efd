//! Shared in-memory store used by tests and embedded hosts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{ConfigRecord, ConfigStore};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Default)]
struct MemoryInner {
    records: BTreeMap<String, String>,
    gets: usize,
    puts: usize,
    commits: usize,
}

/// Cloneable handle over one shared map.
///
/// Clones observe each other's writes, which models separate processes sharing
/// one database. Writes are visible immediately; commits are only counted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, operation: &'static str) -> StoreResult<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Poisoned { operation })
    }

    /// Synchronous peek at a stored record.
    #[must_use]
    pub fn record(&self, key: &str) -> Option<ConfigRecord> {
        let inner = self.lock("record").ok()?;
        inner
            .records
            .get(key)
            .map(|value| ConfigRecord::new(key, value.clone()))
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock("len").map_or(0, |inner| inner.records.len())
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `get` calls served so far.
    #[must_use]
    pub fn get_count(&self) -> usize {
        self.lock("get_count").map_or(0, |inner| inner.gets)
    }

    /// Number of `put` calls served so far.
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.lock("put_count").map_or(0, |inner| inner.puts)
    }

    /// Number of `commit` calls served so far.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.lock("commit_count").map_or(0, |inner| inner.commits)
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<ConfigRecord>> {
        let mut inner = self.lock("get")?;
        inner.gets += 1;
        Ok(inner
            .records
            .get(key)
            .map(|value| ConfigRecord::new(key, value.clone())))
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<ConfigRecord> {
        let mut inner = self.lock("put")?;
        inner.puts += 1;
        inner.records.insert(key.to_string(), value.to_string());
        Ok(ConfigRecord::new(key, value))
    }

    async fn delete(&self, key: &str) -> StoreResult<Option<ConfigRecord>> {
        let mut inner = self.lock("delete")?;
        Ok(inner
            .records
            .remove(key)
            .map(|value| ConfigRecord::new(key, value)))
    }

    async fn commit(&self) -> StoreResult<()> {
        self.lock("commit")?.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_records() -> anyhow::Result<()> {
        let first = MemoryStore::new();
        let second = first.clone();
        first.put("MAX_USERS", "10").await?;
        assert_eq!(
            second.get("MAX_USERS").await?,
            Some(ConfigRecord::new("MAX_USERS", "10"))
        );
        assert_eq!(second.len(), 1);
        assert_eq!(first.get_count(), 1);
        assert_eq!(first.put_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_keys_are_none() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.get("ABSENT").await?, None);
        assert_eq!(store.delete("ABSENT").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn put_replaces_and_delete_returns_record() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.put("SITE_NAME", "\"a\"").await?;
        store.put("SITE_NAME", "\"b\"").await?;
        store.commit().await?;
        assert_eq!(store.record("SITE_NAME"), Some(ConfigRecord::new("SITE_NAME", "\"b\"")));
        assert_eq!(
            store.delete("SITE_NAME").await?,
            Some(ConfigRecord::new("SITE_NAME", "\"b\""))
        );
        assert!(store.is_empty());
        assert_eq!(store.commit_count(), 1);
        Ok(())
    }
}
