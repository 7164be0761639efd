//! Change detection and broadcast between sibling processes.
//!
//! # Design
//! - A [`Notifier`] publishes a [`Timestamp`] after a local write; a [`Watcher`]
//!   turns every stamp it sees into a call to [`StateObserver::observe`].
//! - Strategies are interchangeable: every pair honours the same contract and the
//!   timestamp gate lives in the state, not in the strategy.
//! - Watch loops never give up on transient faults; they log and back off until
//!   cancelled.
//! - Pub/sub sessions run through [`run_sessions`]; a session that ends is
//!   re-attached and followed by a full reload, because stamps published while
//!   detached are never redelivered.

mod file;
mod local;
mod postgres;
#[cfg(feature = "redis")]
mod redis;

use std::fmt::Debug;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::stamp::Timestamp;
use crate::state::StateObserver;

pub use file::{FileNotifier, FileWatcher};
pub use local::LocalBus;
pub use postgres::{PgNotifier, PgWatcher};
#[cfg(feature = "redis")]
pub use self::redis::{RedisNotifier, RedisWatcher};

/// Default sentinel file for the polling strategy.
pub const DEFAULT_WATCHER_FILE: &str = "/tmp/waffleconf.txt";
/// Default pub/sub channel name.
pub const DEFAULT_CHANNEL: &str = waffle_data::DEFAULT_CHANNEL;
/// Default polling interval for the sentinel file.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Broadcasts that the store changed at `stamp`.
#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    /// Publish `stamp` to every sibling process.
    async fn notify(&self, stamp: Timestamp) -> SyncResult<()>;
}

/// Observes stamps published by sibling processes.
#[async_trait]
pub trait Watcher: Send + Debug {
    /// Run until `cancel` fires, passing every observed stamp to `observer`.
    async fn watch(self: Box<Self>, observer: StateObserver, cancel: CancellationToken);
}

/// Matched notifier and watcher for one strategy.
#[derive(Debug)]
pub struct SyncPair {
    /// Publishing half, shared with the state.
    pub notifier: Arc<dyn Notifier>,
    /// Observing half, moved into the background task.
    pub watcher: Box<dyn Watcher>,
}

impl SyncPair {
    /// Assemble a pair from concrete halves.
    #[must_use]
    pub fn new(notifier: impl Notifier + 'static, watcher: impl Watcher + 'static) -> Self {
        Self {
            notifier: Arc::new(notifier),
            watcher: Box::new(watcher),
        }
    }
}

/// Strategy selection with its parameters.
#[derive(Debug, Clone)]
pub enum SyncBackend {
    /// Sentinel-file mtime polling.
    File {
        /// Sentinel location.
        path: PathBuf,
        /// Poll period.
        interval: Duration,
    },
    /// Redis publish/subscribe.
    #[cfg(feature = "redis")]
    Redis {
        /// Server host name.
        host: String,
        /// Server port.
        port: u16,
        /// Channel name.
        channel: String,
    },
    /// `PostgreSQL` LISTEN/NOTIFY on the store's database.
    Postgres {
        /// Pool used for NOTIFY and for opening the listener.
        pool: PgPool,
        /// Channel name.
        channel: String,
    },
    /// In-process broadcast bus.
    Local(LocalBus),
}

impl SyncBackend {
    /// Build the notifier/watcher pair for this strategy.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`](crate::error::SyncError) when the sentinel file
    /// cannot be created or the pub/sub client cannot be configured.
    pub async fn build(self) -> SyncResult<SyncPair> {
        match self {
            Self::File { path, interval } => {
                file::ensure_sentinel(&path).await?;
                Ok(SyncPair::new(
                    FileNotifier::new(path.clone()),
                    FileWatcher::new(path, interval),
                ))
            }
            #[cfg(feature = "redis")]
            Self::Redis {
                host,
                port,
                channel,
            } => {
                let client = self::redis::open_client(&host, port)?;
                Ok(SyncPair::new(
                    RedisNotifier::new(client.clone(), channel.clone()),
                    RedisWatcher::new(client, channel),
                ))
            }
            Self::Postgres { pool, channel } => Ok(SyncPair::new(
                PgNotifier::new(pool.clone(), channel.clone()),
                PgWatcher::new(pool, channel),
            )),
            Self::Local(bus) => Ok(bus.pair()),
        }
    }
}

/// Exponential reconnect delay, doubling from one second up to thirty.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let capped = attempt.min(5);
    let millis = 1_000u64.saturating_mul(2u64.saturating_pow(capped));
    Duration::from_millis(millis.clamp(1_000, 30_000))
}

/// Sleep for `delay` unless `cancel` fires first; returns `false` when cancelled.
pub(crate) async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Stamps delivered by one pub/sub session.
///
/// Malformed payloads arrive as [`SyncError::InvalidPayload`] and are skipped;
/// any other error, or the end of the stream, closes the session.
pub(crate) type StampStream = BoxStream<'static, SyncResult<Timestamp>>;

/// Drive pub/sub sessions until `cancel` fires.
///
/// `attach` opens a subscription. Every session after the first is followed by
/// [`StateObserver::resync`] once subscribed, so writes made while detached are
/// picked up even though their stamps were lost.
pub(crate) async fn run_sessions<A, F>(
    channel: &str,
    observer: &StateObserver,
    cancel: &CancellationToken,
    mut attach: A,
) where
    A: FnMut() -> F + Send,
    F: Future<Output = SyncResult<StampStream>> + Send,
{
    let mut failures = 0u32;
    let mut attached_before = false;
    'session: loop {
        let attached = tokio::select! {
            () = cancel.cancelled() => break,
            attached = attach() => attached,
        };
        match attached {
            Ok(mut stamps) => {
                failures = 0;
                if attached_before {
                    match observer.resync().await {
                        Ok(_) => debug!(channel, "reloaded after re-attaching"),
                        Err(err) => warn!(error = ?err, channel, "failed to reload after re-attaching"),
                    }
                }
                attached_before = true;
                let ended = loop {
                    let next = tokio::select! {
                        () = cancel.cancelled() => break 'session,
                        next = stamps.next() => next,
                    };
                    match next {
                        Some(Ok(stamp)) => {
                            if let Err(err) = observer.observe(stamp).await {
                                warn!(error = ?err, %stamp, "failed to reconcile after published stamp");
                            }
                        }
                        Some(Err(err @ SyncError::InvalidPayload { .. })) => {
                            warn!(error = ?err, channel, "ignoring malformed published stamp");
                        }
                        Some(Err(err)) => break err,
                        None => {
                            break SyncError::ChannelClosed {
                                channel: channel.to_string(),
                            };
                        }
                    }
                };
                warn!(error = ?ended, channel, "subscription ended; reconnecting");
            }
            Err(err) => warn!(error = ?err, channel, "failed to subscribe"),
        }
        if !pause(backoff_delay(failures), cancel).await {
            break;
        }
        failures = failures.saturating_add(1);
    }
    debug!(channel, "subscription watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use crate::state::WaffleState;
    use crate::store::{ConfigStore, MemoryStore};
    use futures_util::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_is_bounded() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn pause_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!pause(Duration::from_secs(60), &cancel).await);
        assert!(pause(Duration::from_millis(1), &CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn dropped_session_reloads_writes_missed_while_detached() -> anyhow::Result<()> {
        let schema = SchemaRegistry::from_value(&json!({
            "MAX_USERS": {"type": "int", "desc": "Max users", "default": 10}
        }))?;
        let store = MemoryStore::new();
        let state = WaffleState::builder(schema, store.clone()).start().await?;
        assert_eq!(state.get("MAX_USERS").await, Some(json!(10)));

        // A sibling writes while no stamp can reach this process.
        store.put("MAX_USERS", "25").await?;
        store.commit().await?;

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let cancel = CancellationToken::new();
        let observer = state.observer();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            run_sessions("waffleconf", &observer, &token, move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                let stamps: StampStream = if attempt == 0 {
                    stream::empty().boxed()
                } else {
                    stream::pending().boxed()
                };
                futures_util::future::ready(Ok(stamps))
            })
            .await;
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while state.get("MAX_USERS").await != Some(json!(25)) {
            assert!(tokio::time::Instant::now() < deadline, "missed write never reloaded");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await?;
        Ok(())
    }

    #[tokio::test]
    async fn first_session_does_not_reload() -> anyhow::Result<()> {
        let schema = SchemaRegistry::from_value(&json!({
            "MAX_USERS": {"type": "int", "desc": "Max users", "default": 10}
        }))?;
        let store = MemoryStore::new();
        let state = WaffleState::builder(schema, store.clone()).start().await?;
        let gets = store.get_count();

        let cancel = CancellationToken::new();
        let observer = state.observer();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            run_sessions("waffleconf", &observer, &token, || {
                futures_util::future::ready(Ok::<StampStream, SyncError>(stream::pending().boxed()))
            })
            .await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get_count(), gets);

        cancel.cancel();
        task.await?;
        Ok(())
    }

    #[tokio::test]
    async fn stamps_reach_the_gate_and_malformed_ones_are_skipped() -> anyhow::Result<()> {
        let schema = SchemaRegistry::from_value(&json!({
            "MAX_USERS": {"type": "int", "desc": "Max users", "default": 10}
        }))?;
        let store = MemoryStore::new();
        let state = WaffleState::builder(schema, store.clone()).start().await?;
        store.put("MAX_USERS", "40").await?;
        let stamp = Timestamp::next_after(state.last_seen());

        let cancel = CancellationToken::new();
        let observer = state.observer();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            run_sessions("waffleconf", &observer, &token, move || {
                let items: Vec<SyncResult<Timestamp>> = vec![
                    "soon".parse::<Timestamp>(),
                    Ok(stamp),
                ];
                futures_util::future::ready(Ok::<StampStream, SyncError>(
                    stream::iter(items).chain(stream::pending()).boxed(),
                ))
            })
            .await;
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while state.get("MAX_USERS").await != Some(json!(40)) {
            assert!(tokio::time::Instant::now() < deadline, "stamp never observed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state.observer().last_seen(), Some(stamp));

        cancel.cancel();
        task.await?;
        Ok(())
    }
}
