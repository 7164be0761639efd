//! Redis publish/subscribe strategy.

use std::fmt;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Notifier, StampStream, Watcher, run_sessions};
use crate::error::{SyncError, SyncResult};
use crate::stamp::Timestamp;
use crate::state::StateObserver;

fn redis_err(operation: &'static str) -> impl FnOnce(redis::RedisError) -> SyncError {
    move |source| SyncError::Redis { operation, source }
}

/// Build a client for `host:port`; no connection is made yet.
pub(super) fn open_client(host: &str, port: u16) -> SyncResult<Client> {
    Client::open(format!("redis://{host}:{port}/")).map_err(redis_err("open client"))
}

/// Publishes stamps on a Redis channel.
pub struct RedisNotifier {
    client: Client,
    channel: String,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl fmt::Debug for RedisNotifier {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RedisNotifier")
            .field("client", &self.client)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl RedisNotifier {
    /// Notifier publishing on `channel`.
    #[must_use]
    pub fn new(client: Client, channel: String) -> Self {
        Self {
            client,
            channel,
            connection: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn notify(&self, stamp: Timestamp) -> SyncResult<()> {
        let mut slot = self.connection.lock().await;
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(redis_err("connect"))?,
        };
        let receivers: i64 = connection
            .publish(&self.channel, stamp.to_string())
            .await
            .map_err(redis_err("publish"))?;
        *slot = Some(connection);
        debug!(channel = %self.channel, %stamp, receivers, "published stamp");
        Ok(())
    }
}

/// Receives stamps through a Redis subscription.
#[derive(Debug)]
pub struct RedisWatcher {
    client: Client,
    channel: String,
}

impl RedisWatcher {
    /// Watcher subscribed to `channel`.
    #[must_use]
    pub const fn new(client: Client, channel: String) -> Self {
        Self { client, channel }
    }

    async fn attach(&self) -> SyncResult<StampStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(redis_err("connect"))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(redis_err("subscribe"))?;
        info!(channel = %self.channel, "subscribed to configuration stamps");
        Ok(pubsub
            .into_on_message()
            .map(|message| String::from_utf8_lossy(message.get_payload_bytes()).parse::<Timestamp>())
            .boxed())
    }
}

#[async_trait]
impl Watcher for RedisWatcher {
    async fn watch(self: Box<Self>, observer: StateObserver, cancel: CancellationToken) {
        run_sessions(&self.channel, &observer, &cancel, || self.attach()).await;
    }
}
