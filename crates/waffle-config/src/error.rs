//! Error types for configuration operations.
//!
//! # Design
//! - Messages are constant; context travels in structured fields.
//! - Sources are preserved so callers log once at the boundary.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use waffle_data::DataError;

use crate::kind::ConfigType;

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Schema declared a type tag outside the supported set.
    #[error("unknown configuration type")]
    UnknownType {
        /// Key whose declaration carried the tag.
        key: String,
        /// Offending type tag.
        value: String,
    },
    /// Schema entry was structurally invalid.
    #[error("invalid schema entry")]
    InvalidSchema {
        /// Key of the offending entry.
        key: String,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Schema document could not be parsed.
    #[error("failed to parse schema document")]
    SchemaDocument {
        /// Source parse error.
        source: serde_json::Error,
    },
    /// A value did not conform to the declared type of its key.
    #[error("invalid configuration value")]
    InvalidValue {
        /// Key being converted.
        key: String,
        /// Declared type of the key.
        kind: ConfigType,
        /// Offending value rendered as text.
        value: String,
    },
    /// Encoding or decoding a stored payload failed.
    #[error("configuration value codec failed")]
    Codec {
        /// Key whose payload failed to convert.
        key: String,
        /// Source codec error.
        source: CodecError,
    },
    /// Backing store operation failed.
    #[error("configuration store operation failed")]
    Store {
        /// Operation identifier.
        operation: &'static str,
        /// Key involved, when the operation targets a single record.
        key: Option<String>,
        /// Source store error.
        source: StoreError,
    },
    /// A synchronisation toggle carried an unusable value.
    #[error("invalid waffle setting")]
    InvalidSetting {
        /// Setting name.
        field: &'static str,
        /// Offending value when available.
        value: Option<String>,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Change propagation failed.
    #[error("configuration change propagation failed")]
    Sync {
        /// Operation identifier.
        operation: &'static str,
        /// Source propagation error.
        source: SyncError,
    },
}

impl ConfigError {
    pub(crate) fn store(operation: &'static str, key: Option<&str>, source: StoreError) -> Self {
        Self::Store {
            operation,
            key: key.map(str::to_string),
            source,
        }
    }

    pub(crate) fn codec(key: &str, source: CodecError) -> Self {
        Self::Codec {
            key: key.to_string(),
            source,
        }
    }

    pub(crate) fn invalid_value(key: &str, kind: ConfigType, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            kind,
            value: value.into(),
        }
    }
}

/// Failure converting between application values and stored payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Value could not be encoded.
    #[error("failed to encode value")]
    Encode {
        /// Source serialisation error.
        source: serde_json::Error,
    },
    /// Stored payload was malformed.
    #[error("failed to decode stored payload")]
    Decode {
        /// Source parse error.
        source: serde_json::Error,
    },
}

/// Failure raised by a [`ConfigStore`](crate::store::ConfigStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the store file failed.
    #[error("store file operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// File involved.
        path: PathBuf,
        /// Source IO error.
        source: io::Error,
    },
    /// Store file did not contain a key/value document.
    #[error("store file is corrupt")]
    Corrupt {
        /// File involved.
        path: PathBuf,
        /// Source parse error.
        source: serde_json::Error,
    },
    /// Connecting to the database failed.
    #[error("failed to connect to configuration database")]
    Connect {
        /// Source database error.
        source: sqlx::Error,
    },
    /// Database statement failed.
    #[error("configuration database operation failed")]
    Data {
        /// Source data-layer error.
        source: DataError,
    },
    /// In-memory state was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned {
        /// Operation identifier.
        operation: &'static str,
    },
    /// Taking the cross-process store file lock failed.
    #[cfg(unix)]
    #[error("store file lock failed")]
    Lock {
        /// Lock file involved.
        path: PathBuf,
        /// Underlying nix error.
        source: nix::Error,
    },
    /// Blocking store task panicked or was cancelled.
    #[error("blocking store task failed")]
    Task {
        /// Operation identifier.
        operation: &'static str,
        /// Source join error.
        source: tokio::task::JoinError,
    },
}

/// Failure raised by a [`Notifier`](crate::sync::Notifier) or [`Watcher`](crate::sync::Watcher).
#[derive(Debug, Error)]
pub enum SyncError {
    /// Sentinel file operation failed.
    #[error("sentinel file operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Sentinel path.
        path: PathBuf,
        /// Source IO error.
        source: io::Error,
    },
    /// Publishing through the database failed.
    #[error("database notification failed")]
    Data {
        /// Source data-layer error.
        source: DataError,
    },
    /// LISTEN connection failed.
    #[error("database listener failed")]
    Listen {
        /// Operation identifier.
        operation: &'static str,
        /// Source database error.
        source: sqlx::Error,
    },
    /// Redis pub/sub operation failed.
    #[cfg(feature = "redis")]
    #[error("redis pub/sub operation failed")]
    Redis {
        /// Operation identifier.
        operation: &'static str,
        /// Source redis error.
        source: redis::RedisError,
    },
    /// Notification payload was not a timestamp.
    #[error("invalid notification payload")]
    InvalidPayload {
        /// Payload as received.
        payload: String,
    },
    /// Subscription ended.
    #[error("notification channel closed")]
    ChannelClosed {
        /// Channel name.
        channel: String,
    },
    /// Blocking helper task failed to complete.
    #[error("blocking task failed")]
    Task {
        /// Source join error.
        source: tokio::task::JoinError,
    },
}

/// Result alias for propagation operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
