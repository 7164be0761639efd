//! Orchestrator owning the live configuration.
//!
//! # Design
//! - One [`WaffleState`] per host instance; clones share the same state.
//! - Writers (`update_db`, `update_conf`, gated reconciles) are serialised by a
//!   write mutex, readers only take the `RwLock` read side.
//! - In multi-process mode one background task runs the configured [`Watcher`];
//!   it holds only a weak reference so dropping the last handle stops it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::codec;
use crate::error::{ConfigError, ConfigResult};
use crate::schema::{KeyFilter, SchemaEntry, SchemaRegistry};
use crate::stamp::Timestamp;
use crate::store::ConfigStore;
use crate::sync::{Notifier, SyncBackend, SyncPair, Watcher};

/// Decoded configuration values keyed by variable name.
pub type LiveConfig = BTreeMap<String, Value>;

struct Inner {
    schema: SchemaRegistry,
    store: Arc<dyn ConfigStore>,
    filter: KeyFilter,
    live: RwLock<LiveConfig>,
    mirror: watch::Sender<Arc<LiveConfig>>,
    write_lock: Mutex<()>,
    last_seen: AtomicI64,
    notifier: Option<Arc<dyn Notifier>>,
    cancel: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    fn last_seen(&self) -> Timestamp {
        Timestamp::from_micros(self.last_seen.load(Ordering::Acquire))
    }

    fn adopt(&self, stamp: Timestamp) {
        self.last_seen
            .fetch_max(stamp.as_micros(), Ordering::AcqRel);
    }
}

/// Shared handle to the configuration overlay.
#[derive(Clone)]
pub struct WaffleState(Arc<Inner>);

impl fmt::Debug for WaffleState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("WaffleState")
            .field("keys", &self.0.schema.len())
            .field("filter", &self.0.filter)
            .field("multiprocess", &self.is_multiprocess())
            .field("last_seen", &self.0.last_seen())
            .finish_non_exhaustive()
    }
}

enum SyncSource {
    Backend(SyncBackend),
    Pair(SyncPair),
}

/// Configures and starts a [`WaffleState`].
pub struct WaffleStateBuilder {
    schema: SchemaRegistry,
    store: Arc<dyn ConfigStore>,
    filter: KeyFilter,
    sync: Option<SyncSource>,
}

impl fmt::Debug for WaffleStateBuilder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("WaffleStateBuilder")
            .field("keys", &self.schema.len())
            .field("filter", &self.filter)
            .field("multiprocess", &self.sync.is_some())
            .finish_non_exhaustive()
    }
}

impl WaffleStateBuilder {
    /// Builder over a shared store handle.
    #[must_use]
    pub fn new(schema: SchemaRegistry, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            schema,
            store,
            filter: KeyFilter::default(),
            sync: None,
        }
    }

    /// Replace the reserved-key filter.
    #[must_use]
    pub fn key_filter(mut self, filter: KeyFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Enable multi-process mode with the given strategy.
    #[must_use]
    pub fn sync(mut self, backend: SyncBackend) -> Self {
        self.sync = Some(SyncSource::Backend(backend));
        self
    }

    /// Enable multi-process mode with a prebuilt notifier/watcher pair.
    #[must_use]
    pub fn sync_pair(mut self, pair: SyncPair) -> Self {
        self.sync = Some(SyncSource::Pair(pair));
        self
    }

    /// Start the state: capture the baseline stamp, spawn the watcher when in
    /// multi-process mode, then load every declared key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Sync`] when the strategy cannot be built and any
    /// error raised by the initial reconciliation.
    pub async fn start(self) -> ConfigResult<WaffleState> {
        let pair = match self.sync {
            None => None,
            Some(SyncSource::Pair(pair)) => Some(pair),
            Some(SyncSource::Backend(backend)) => Some(
                backend
                    .build()
                    .await
                    .map_err(|source| ConfigError::Sync {
                        operation: "build strategy",
                        source,
                    })?,
            ),
        };
        let (notifier, watcher) = match pair {
            Some(SyncPair { notifier, watcher }) => (Some(notifier), Some(watcher)),
            None => (None, None),
        };
        let baseline = if notifier.is_some() {
            Timestamp::now()
        } else {
            Timestamp::default()
        };
        let (mirror, _) = watch::channel(Arc::new(LiveConfig::new()));
        let state = WaffleState(Arc::new(Inner {
            schema: self.schema,
            store: self.store,
            filter: self.filter,
            live: RwLock::new(LiveConfig::new()),
            mirror,
            write_lock: Mutex::new(()),
            last_seen: AtomicI64::new(baseline.as_micros()),
            notifier,
            cancel: CancellationToken::new(),
            task: StdMutex::new(None),
        }));
        if let Some(watcher) = watcher {
            state.spawn_watcher(watcher);
        }
        state.update_conf().await?;
        info!(
            keys = state.0.schema.len(),
            multiprocess = state.is_multiprocess(),
            %baseline,
            "configuration overlay started"
        );
        Ok(state)
    }
}

/// Weak handle given to watchers; it never keeps the state alive.
#[derive(Clone)]
pub struct StateObserver {
    inner: Weak<Inner>,
}

impl fmt::Debug for StateObserver {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StateObserver")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl StateObserver {
    /// Apply the timestamp gate; see [`WaffleState::observe`].
    ///
    /// Returns `Ok(false)` once the state has been dropped.
    ///
    /// # Errors
    ///
    /// Propagates reconciliation failures.
    pub async fn observe(&self, stamp: Timestamp) -> ConfigResult<bool> {
        match self.inner.upgrade() {
            Some(inner) => WaffleState(inner).observe(stamp).await,
            None => Ok(false),
        }
    }

    /// Reload every declared key without adopting a stamp.
    ///
    /// Watchers call this after re-establishing a dropped session, since stamps
    /// published while detached are never delivered. Returns `Ok(false)` once the
    /// state has been dropped.
    ///
    /// # Errors
    ///
    /// Propagates reconciliation failures.
    pub async fn resync(&self) -> ConfigResult<bool> {
        match self.inner.upgrade() {
            Some(inner) => WaffleState(inner).update_conf().await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Last adopted stamp, or `None` once the state has been dropped.
    #[must_use]
    pub fn last_seen(&self) -> Option<Timestamp> {
        self.inner.upgrade().map(|inner| inner.last_seen())
    }
}

impl WaffleState {
    /// Builder over `store`.
    #[must_use]
    pub fn builder(schema: SchemaRegistry, store: impl ConfigStore + 'static) -> WaffleStateBuilder {
        WaffleStateBuilder::new(schema, Arc::new(store))
    }

    fn spawn_watcher(&self, watcher: Box<dyn Watcher>) {
        let observer = self.observer();
        let cancel = self.0.cancel.clone();
        let handle = tokio::spawn(watcher.watch(observer, cancel));
        if let Ok(mut slot) = self.0.task.lock() {
            *slot = Some(handle);
        }
    }

    /// Weak handle for watchers.
    #[must_use]
    pub fn observer(&self) -> StateObserver {
        StateObserver {
            inner: Arc::downgrade(&self.0),
        }
    }

    fn editable(&self, entry: &SchemaEntry) -> bool {
        !self.0.filter.is_reserved(&entry.key)
    }

    /// Read-through reconciliation of declared keys against the store.
    ///
    /// Every requested, declared, non-reserved key is loaded; keys without a record
    /// are seeded with their default and committed in one batch. Keys outside the
    /// schema or reserved by the filter are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Store`] on backend failures and [`ConfigError::Codec`]
    /// when a non-JSON record cannot be decoded.
    pub async fn parse_conf(&self, keys: Option<&[&str]>) -> ConfigResult<LiveConfig> {
        let entries: Vec<&SchemaEntry> = match keys {
            None => self.0.schema.iter().collect(),
            Some(keys) => keys.iter().filter_map(|key| self.0.schema.get(key)).collect(),
        };
        let store = &self.0.store;
        let mut conf = LiveConfig::new();
        let mut seeded = 0usize;
        for entry in entries.into_iter().filter(|entry| self.editable(entry)) {
            let key = entry.key.as_str();
            let record = store
                .get(key)
                .await
                .map_err(|source| ConfigError::store("get", Some(key), source))?;
            let value = match record {
                Some(record) => entry.kind.decode_stored(key, &record.value)?,
                None => {
                    let payload = codec::serialize(&entry.default)
                        .map_err(|source| ConfigError::codec(key, source))?;
                    store
                        .put(key, &payload)
                        .await
                        .map_err(|source| ConfigError::store("put", Some(key), source))?;
                    seeded += 1;
                    entry.default.clone()
                }
            };
            conf.insert(key.to_string(), value);
        }
        if seeded > 0 {
            store
                .commit()
                .await
                .map_err(|source| ConfigError::store("commit", None, source))?;
            debug!(seeded, "seeded configuration defaults");
        }
        Ok(conf)
    }

    /// Persist changed values, merge them into the live configuration and notify
    /// sibling processes.
    ///
    /// Reserved and undeclared keys are dropped silently, as are values equal to
    /// the current live value. An empty result performs no store write and no
    /// notification. A failed notification is logged; the local update stands.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a value does not fit its declared
    /// type (nothing is persisted in that case) and [`ConfigError::Store`] on
    /// backend failures.
    #[instrument(name = "waffle_state.update_db", skip_all, fields(requested = new_values.len()))]
    pub async fn update_db(&self, new_values: BTreeMap<String, Value>) -> ConfigResult<LiveConfig> {
        let guard = self.0.write_lock.lock().await;
        let mut applied = LiveConfig::new();
        {
            let live = self.0.live.read().await;
            for (key, value) in new_values {
                if self.0.filter.is_reserved(&key) {
                    debug!(key, "ignoring reserved key");
                    continue;
                }
                let Some(entry) = self.0.schema.get(&key) else {
                    debug!(key, "ignoring undeclared key");
                    continue;
                };
                let value = entry.kind.coerce(&key, value)?;
                if live.get(&key) == Some(&value) {
                    continue;
                }
                applied.insert(key, value);
            }
        }
        if applied.is_empty() {
            return Ok(applied);
        }

        let store = &self.0.store;
        for (key, value) in &applied {
            let payload =
                codec::serialize(value).map_err(|source| ConfigError::codec(key, source))?;
            store
                .put(key, &payload)
                .await
                .map_err(|source| ConfigError::store("put", Some(key), source))?;
        }
        store
            .commit()
            .await
            .map_err(|source| ConfigError::store("commit", None, source))?;
        self.merge(&applied).await;

        let stamp = self.0.notifier.as_ref().map(|_| {
            let stamp = Timestamp::next_after(self.0.last_seen());
            self.0.adopt(stamp);
            stamp
        });
        drop(guard);

        if let (Some(notifier), Some(stamp)) = (&self.0.notifier, stamp) {
            if let Err(err) = notifier.notify(stamp).await {
                warn!(error = ?err, %stamp, "failed to notify sibling processes");
            }
        }
        info!(applied = applied.len(), "configuration updated");
        Ok(applied)
    }

    /// Reload every declared key from the store into the live configuration.
    ///
    /// # Errors
    ///
    /// Propagates [`WaffleState::parse_conf`] failures.
    #[instrument(name = "waffle_state.update_conf", skip_all)]
    pub async fn update_conf(&self) -> ConfigResult<()> {
        let _guard = self.0.write_lock.lock().await;
        self.reconcile_locked().await
    }

    async fn reconcile_locked(&self) -> ConfigResult<()> {
        let conf = self.parse_conf(None).await?;
        if conf.is_empty() {
            return Ok(());
        }
        self.merge(&conf).await;
        Ok(())
    }

    async fn merge(&self, values: &LiveConfig) {
        let mut live = self.0.live.write().await;
        live.extend(values.iter().map(|(key, value)| (key.clone(), value.clone())));
        self.0.mirror.send_replace(Arc::new(live.clone()));
    }

    /// Timestamp gate shared by every watcher.
    ///
    /// A stamp strictly newer than the last adopted one triggers exactly one
    /// reconciliation and is then adopted; older or equal stamps are ignored.
    ///
    /// # Errors
    ///
    /// Propagates reconciliation failures; the stamp is not adopted in that case.
    #[instrument(name = "waffle_state.observe", skip(self), fields(%stamp))]
    pub async fn observe(&self, stamp: Timestamp) -> ConfigResult<bool> {
        if stamp <= self.0.last_seen() {
            return Ok(false);
        }
        let _guard = self.0.write_lock.lock().await;
        if stamp <= self.0.last_seen() {
            return Ok(false);
        }
        self.reconcile_locked().await?;
        self.0.adopt(stamp);
        debug!("reconciled after sibling change");
        Ok(true)
    }

    /// Current value of `key`.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.0.live.read().await.get(key).cloned()
    }

    /// Current value of `key` deserialised into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the value does not deserialise.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> ConfigResult<Option<T>> {
        let Some(value) = self.get(key).await else {
            return Ok(None);
        };
        serde_json::from_value(value.clone()).map(Some).map_err(|_| {
            let kind = self
                .0
                .schema
                .get(key)
                .map_or(crate::kind::ConfigType::Json, |entry| entry.kind);
            ConfigError::invalid_value(key, kind, value.to_string())
        })
    }

    /// Snapshot of the live configuration.
    pub async fn live(&self) -> LiveConfig {
        self.0.live.read().await.clone()
    }

    /// Receiver of live configuration snapshots, updated after every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<LiveConfig>> {
        self.0.mirror.subscribe()
    }

    /// Declared variables.
    #[must_use]
    pub fn schema(&self) -> &SchemaRegistry {
        &self.0.schema
    }

    /// Reserved-key filter in force.
    #[must_use]
    pub fn key_filter(&self) -> &KeyFilter {
        &self.0.filter
    }

    /// Declared entries a user may edit, in key order.
    pub fn editable_entries(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.0.schema.iter().filter(|entry| self.editable(entry))
    }

    /// Last adopted change stamp.
    #[must_use]
    pub fn last_seen(&self) -> Timestamp {
        self.0.last_seen()
    }

    /// Whether a notifier/watcher pair is attached.
    #[must_use]
    pub fn is_multiprocess(&self) -> bool {
        self.0.notifier.is_some()
    }

    /// Stop the background watcher and wait for it to finish.
    pub async fn shutdown(&self) {
        self.0.cancel.cancel();
        let handle = self.0.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = ?err, "watcher task ended abnormally");
            }
        }
        debug!("configuration overlay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_value(&json!({
            "MAX_USERS": {"type": "int", "desc": "Max users", "default": 10},
            "SITE_NAME": {"type": "str", "desc": "Site name", "default": "Waffle"},
            "FEATURES": {"type": "json", "desc": "Flags", "default": {"beta": true}},
            "WAFFLE_MULTIPROC": {"type": "bool", "desc": "", "default": true}
        }))
        .expect("registry")
    }

    #[tokio::test]
    async fn start_seeds_defaults_once() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let state = WaffleState::builder(registry(), store.clone()).start().await?;
        assert_eq!(store.len(), 3);
        assert_eq!(store.commit_count(), 1);
        assert_eq!(state.get("MAX_USERS").await, Some(json!(10)));
        assert_eq!(state.get("WAFFLE_MULTIPROC").await, None);

        let again = state.parse_conf(None).await?;
        assert_eq!(again.len(), 3);
        assert_eq!(store.len(), 3);
        assert_eq!(store.commit_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn parse_conf_honours_key_subset() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let state = WaffleState::builder(registry(), store.clone()).start().await?;
        let subset = state
            .parse_conf(Some(&["MAX_USERS", "UNKNOWN", "WAFFLE_MULTIPROC"]))
            .await?;
        assert_eq!(subset.keys().collect::<Vec<_>>(), vec!["MAX_USERS"]);
        Ok(())
    }

    #[tokio::test]
    async fn stored_values_win_over_defaults() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.put("MAX_USERS", "42").await?;
        store.put("FEATURES", "{broken").await?;
        let state = WaffleState::builder(registry(), store.clone()).start().await?;
        assert_eq!(state.get("MAX_USERS").await, Some(json!(42)));
        assert_eq!(state.get("FEATURES").await, Some(Value::Null));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_scalar_record_fails_start() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.put("MAX_USERS", "{broken").await?;
        let err = WaffleState::builder(registry(), store)
            .start()
            .await
            .expect_err("codec failure");
        assert!(matches!(err, ConfigError::Codec { ref key, .. } if key == "MAX_USERS"));
        Ok(())
    }

    #[tokio::test]
    async fn update_db_applies_and_publishes_snapshot() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let state = WaffleState::builder(registry(), store.clone()).start().await?;
        let mut snapshots = state.subscribe();
        let applied = state
            .update_db(BTreeMap::from([
                ("MAX_USERS".to_string(), json!("25")),
                ("SITE_NAME".to_string(), json!("Waffle")),
            ]))
            .await?;
        assert_eq!(applied, LiveConfig::from([("MAX_USERS".to_string(), json!(25))]));
        assert_eq!(store.record("MAX_USERS").map(|record| record.value), Some("25".to_string()));
        assert!(snapshots.has_changed()?);
        assert_eq!(snapshots.borrow_and_update().get("MAX_USERS"), Some(&json!(25)));
        assert_eq!(state.get_as::<i64>("MAX_USERS").await?, Some(25));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_values_persist_nothing() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let state = WaffleState::builder(registry(), store.clone()).start().await?;
        let puts = store.put_count();
        let err = state
            .update_db(BTreeMap::from([
                ("SITE_NAME".to_string(), json!("New")),
                ("MAX_USERS".to_string(), json!("lots")),
            ]))
            .await
            .expect_err("invalid int");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(store.put_count(), puts);
        assert_eq!(state.get("SITE_NAME").await, Some(json!("Waffle")));
        Ok(())
    }

    #[tokio::test]
    async fn single_process_updates_do_not_stamp() -> anyhow::Result<()> {
        let state = WaffleState::builder(registry(), MemoryStore::new()).start().await?;
        assert!(!state.is_multiprocess());
        assert_eq!(state.last_seen(), Timestamp::default());
        state
            .update_db(BTreeMap::from([("MAX_USERS".to_string(), json!(11))]))
            .await?;
        assert_eq!(state.last_seen(), Timestamp::default());
        state.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn observer_outlives_state_harmlessly() -> anyhow::Result<()> {
        let state = WaffleState::builder(registry(), MemoryStore::new()).start().await?;
        let observer = state.observer();
        assert!(observer.observe(Timestamp::now().successor()).await?);
        drop(state);
        assert!(!observer.observe(Timestamp::now().successor()).await?);
        assert_eq!(observer.last_seen(), None);
        Ok(())
    }
}
