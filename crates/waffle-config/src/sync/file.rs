//! Sentinel-file strategy: the notifier stamps the file mtime, the watcher polls it.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Notifier, Watcher, backoff_delay, pause};
use crate::error::{SyncError, SyncResult};
use crate::stamp::Timestamp;
use crate::state::StateObserver;

fn io_err(operation: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> SyncError {
    let path = path.to_path_buf();
    move |source| SyncError::Io {
        operation,
        path,
        source,
    }
}

/// Create the sentinel as an empty file when it does not exist yet.
pub(super) async fn ensure_sentinel(path: &Path) -> SyncResult<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_err("create sentinel dir", parent))?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err("create sentinel", path))?;
    Ok(())
}

/// Read the sentinel mtime as a stamp.
///
/// # Errors
///
/// Returns [`SyncError::Io`] when the file metadata cannot be read.
async fn read_stamp(path: &Path) -> SyncResult<Timestamp> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(io_err("stat sentinel", path))?;
    let modified = metadata
        .modified()
        .map_err(io_err("read sentinel mtime", path))?;
    Ok(Timestamp::from_system_time(modified))
}

/// Publishes stamps by setting the sentinel modification time.
#[derive(Debug, Clone)]
pub struct FileNotifier {
    path: PathBuf,
}

impl FileNotifier {
    /// Notifier touching `path`.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Notifier for FileNotifier {
    async fn notify(&self, stamp: Timestamp) -> SyncResult<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(io_err("open sentinel", &path))?;
            file.set_modified(stamp.to_system_time())
                .map_err(io_err("set sentinel mtime", &path))
        })
        .await
        .map_err(|source| SyncError::Task { source })??;
        debug!(path = %self.path.display(), %stamp, "stamped sentinel file");
        Ok(())
    }
}

/// Polls the sentinel modification time.
#[derive(Debug, Clone)]
pub struct FileWatcher {
    path: PathBuf,
    interval: Duration,
}

impl FileWatcher {
    /// Watcher polling `path` every `interval`.
    #[must_use]
    pub const fn new(path: PathBuf, interval: Duration) -> Self {
        Self { path, interval }
    }
}

#[async_trait]
impl Watcher for FileWatcher {
    async fn watch(self: Box<Self>, observer: StateObserver, cancel: CancellationToken) {
        info!(path = %self.path.display(), interval = ?self.interval, "polling sentinel file");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let result = match read_stamp(&self.path).await {
                Ok(stamp) => observer.observe(stamp).await.map(|_| ()).map_err(|err| {
                    warn!(error = ?err, "failed to reconcile after sentinel change");
                }),
                Err(err) => {
                    warn!(error = ?err, path = %self.path.display(), "failed to read sentinel file");
                    Err(())
                }
            };
            if result.is_ok() {
                failures = 0;
                continue;
            }
            if !pause(backoff_delay(failures), &cancel).await {
                break;
            }
            failures = failures.saturating_add(1);
        }
        debug!(path = %self.path.display(), "sentinel watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifier_sets_exact_mtime() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sentinel.txt");
        ensure_sentinel(&path).await?;
        let stamp = Timestamp::from_micros(1_800_000_000_123_456);
        FileNotifier::new(path.clone()).notify(stamp).await?;
        assert_eq!(read_stamp(&path).await?, stamp);
        Ok(())
    }

    #[tokio::test]
    async fn ensure_sentinel_creates_missing_file_and_parents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("sentinel.txt");
        ensure_sentinel(&path).await?;
        assert!(path.exists());
        assert_eq!(std::fs::read(&path)?.len(), 0);
        ensure_sentinel(&path).await?;
        Ok(())
    }

    #[tokio::test]
    async fn missing_sentinel_is_an_io_error() {
        let err = read_stamp(Path::new("/nonexistent/waffle/sentinel"))
            .await
            .expect_err("missing file");
        assert!(matches!(err, SyncError::Io { operation: "stat sentinel", .. }));
    }
}
