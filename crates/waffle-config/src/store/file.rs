//! JSON document store shared by processes on one host.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ConfigRecord, ConfigStore};
use crate::error::{StoreError, StoreResult};

type Document = BTreeMap<String, String>;
type Changes = BTreeMap<String, Option<String>>;

fn io_err(operation: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io {
        operation,
        path,
        source,
    }
}

fn parse(path: &Path, bytes: &[u8]) -> StoreResult<Document> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Document::new());
    }
    serde_json::from_slice(bytes).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Exclusive advisory lock on the sibling `.lock` file, held until dropped.
#[cfg(unix)]
fn lock(path: &Path) -> StoreResult<nix::fcntl::Flock<std::fs::File>> {
    use nix::fcntl::{Flock, FlockArg};

    let lock_path = lock_path(path);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(io_err("open lock", &lock_path))?;
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, source)| StoreError::Lock {
        path: lock_path,
        source,
    })
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
const fn lock(_path: &Path) -> StoreResult<()> {
    Ok(())
}

/// Read-merge-replace under the cross-process lock.
fn commit_blocking(path: &Path, changes: &Changes) -> StoreResult<()> {
    let _lock = lock(path)?;
    let mut document = match std::fs::read(path) {
        Ok(bytes) => parse(path, &bytes)?,
        Err(err) if err.kind() == ErrorKind::NotFound => Document::new(),
        Err(source) => return Err(io_err("read", path)(source)),
    };
    for (key, value) in changes {
        match value {
            Some(value) => document.insert(key.clone(), value.clone()),
            None => document.remove(key),
        };
    }
    let bytes = serde_json::to_vec_pretty(&document).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(parent).map_err(io_err("create temp", parent))?;
    temp.write_all(&bytes).map_err(io_err("write", temp.path()))?;
    temp.persist(path).map_err(|err| io_err("rename", path)(err.error))?;
    Ok(())
}

/// Store persisting records as one JSON object file.
///
/// Writes are staged until [`ConfigStore::commit`], which takes an exclusive lock
/// on a sibling `.lock` file, merges the staged changes into the current file
/// contents and replaces the file through a uniquely named temporary. Commits
/// from any number of handles or processes therefore never lose each other's
/// keys. Staged changes are consumed by `commit` whether or not it succeeds.
/// Reads always consult the file so commits from other processes are visible.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    staged: Mutex<Changes>,
}

impl FileStore {
    /// Store backed by `path`; the file is created on first commit.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            staged: Mutex::new(Changes::new()),
        }
    }

    /// Backing file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StoreResult<Document> {
        match fs::read(&self.path).await {
            Ok(bytes) => parse(&self.path, &bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Document::new()),
            Err(source) => Err(io_err("read", &self.path)(source)),
        }
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn get(&self, key: &str) -> StoreResult<Option<ConfigRecord>> {
        if let Some(staged) = self.staged.lock().await.get(key) {
            return Ok(staged
                .as_ref()
                .map(|value| ConfigRecord::new(key, value.clone())));
        }
        let document = self.load().await?;
        Ok(document
            .get(key)
            .map(|value| ConfigRecord::new(key, value.clone())))
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<ConfigRecord> {
        self.staged
            .lock()
            .await
            .insert(key.to_string(), Some(value.to_string()));
        Ok(ConfigRecord::new(key, value))
    }

    async fn delete(&self, key: &str) -> StoreResult<Option<ConfigRecord>> {
        let existing = self.get(key).await?;
        self.staged.lock().await.insert(key.to_string(), None);
        Ok(existing)
    }

    async fn commit(&self) -> StoreResult<()> {
        let changes = std::mem::take(&mut *self.staged.lock().await);
        if changes.is_empty() {
            return Ok(());
        }
        let path = self.path.clone();
        let count = changes.len();
        tokio::task::spawn_blocking(move || commit_blocking(&path, &changes))
            .await
            .map_err(|source| StoreError::Task {
                operation: "commit",
                source,
            })??;
        debug!(path = %self.path.display(), changes = count, "committed store file");
        Ok(())
    }
}
