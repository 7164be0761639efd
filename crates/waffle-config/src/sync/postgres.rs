//! `PostgreSQL` LISTEN/NOTIFY strategy sharing the store's database.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use waffle_data::config;

use super::{Notifier, StampStream, Watcher, run_sessions};
use crate::error::{SyncError, SyncResult};
use crate::stamp::Timestamp;
use crate::state::StateObserver;

/// Publishes stamps with `pg_notify`.
#[derive(Debug, Clone)]
pub struct PgNotifier {
    pool: PgPool,
    channel: String,
}

impl PgNotifier {
    /// Notifier publishing on `channel`.
    #[must_use]
    pub const fn new(pool: PgPool, channel: String) -> Self {
        Self { pool, channel }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn notify(&self, stamp: Timestamp) -> SyncResult<()> {
        config::notify_change(&self.pool, &self.channel, &stamp.to_string())
            .await
            .map_err(|source| SyncError::Data { source })
    }
}

/// Receives stamps through a dedicated LISTEN connection.
#[derive(Debug, Clone)]
pub struct PgWatcher {
    pool: PgPool,
    channel: String,
}

impl PgWatcher {
    /// Watcher listening on `channel`.
    #[must_use]
    pub const fn new(pool: PgPool, channel: String) -> Self {
        Self { pool, channel }
    }

    async fn attach(&self) -> SyncResult<StampStream> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|source| SyncError::Listen {
                operation: "connect",
                source,
            })?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|source| SyncError::Listen {
                operation: "listen",
                source,
            })?;
        info!(channel = %self.channel, "listening for configuration stamps");
        Ok(notifications(listener))
    }
}

/// Stamps from `listener`, ending when its connection is lost.
///
/// `try_recv` is used instead of `recv` so a dropped connection ends the session
/// rather than reconnecting silently and losing the notifications in between.
fn notifications(listener: PgListener) -> StampStream {
    stream::unfold(Some(listener), |listener| async move {
        let mut listener = listener?;
        match listener.try_recv().await {
            Ok(Some(notification)) => {
                Some((notification.payload().parse::<Timestamp>(), Some(listener)))
            }
            Ok(None) => None,
            Err(source) => Some((
                Err(SyncError::Listen {
                    operation: "recv",
                    source,
                }),
                None,
            )),
        }
    })
    .boxed()
}

#[async_trait]
impl Watcher for PgWatcher {
    async fn watch(self: Box<Self>, observer: StateObserver, cancel: CancellationToken) {
        run_sessions(&self.channel, &observer, &cancel, || self.attach()).await;
    }
}
