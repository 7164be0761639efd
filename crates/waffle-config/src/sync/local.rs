//! In-process broadcast strategy connecting several states in one process.

use async_trait::async_trait;
use tokio::sync::broadcast::{self, Receiver, Sender, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Notifier, SyncPair, Watcher};
use crate::error::SyncResult;
use crate::stamp::Timestamp;
use crate::state::StateObserver;

const DEFAULT_CAPACITY: usize = 64;

/// Shared stamp bus built on `tokio::broadcast`.
#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: Sender<Timestamp>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    /// Bus with the default buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus buffering up to `capacity` undelivered stamps per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a stamp, returning how many watchers received it.
    pub fn publish(&self, stamp: Timestamp) -> usize {
        self.sender.send(stamp).unwrap_or(0)
    }

    /// Number of attached watchers.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Notifier/watcher pair; the watcher is subscribed immediately so no stamp
    /// published after this call is missed.
    #[must_use]
    pub fn pair(&self) -> SyncPair {
        SyncPair::new(
            LocalNotifier {
                bus: self.clone(),
            },
            LocalWatcher {
                receiver: self.sender.subscribe(),
            },
        )
    }
}

/// Publishing half of a [`LocalBus`] pair.
#[derive(Debug)]
struct LocalNotifier {
    bus: LocalBus,
}

#[async_trait]
impl Notifier for LocalNotifier {
    async fn notify(&self, stamp: Timestamp) -> SyncResult<()> {
        let delivered = self.bus.publish(stamp);
        debug!(%stamp, delivered, "published stamp on local bus");
        Ok(())
    }
}

/// Observing half of a [`LocalBus`] pair.
#[derive(Debug)]
struct LocalWatcher {
    receiver: Receiver<Timestamp>,
}

#[async_trait]
impl Watcher for LocalWatcher {
    async fn watch(self: Box<Self>, observer: StateObserver, cancel: CancellationToken) {
        let mut receiver = self.receiver;
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = receiver.recv() => received,
            };
            match received {
                Ok(stamp) => {
                    if let Err(err) = observer.observe(stamp).await {
                        warn!(error = ?err, %stamp, "failed to reconcile after local stamp");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "local bus watcher lagged; waiting for a newer stamp");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("local bus watcher stopped");
    }
}
