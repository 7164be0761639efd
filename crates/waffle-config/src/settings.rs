//! Synchronisation toggles read from the host configuration or the environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;

use crate::error::{ConfigError, ConfigResult};
use crate::kind::parse_flag;
use crate::schema::{DEFAULT_RESERVED_PREFIX, KeyFilter};
use crate::sync::{DEFAULT_CHANNEL, DEFAULT_POLL_INTERVAL, DEFAULT_WATCHER_FILE, SyncBackend};

const MULTIPROC: &str = "WAFFLE_MULTIPROC";
const WATCHER_TYPE: &str = "WAFFLE_WATCHER_TYPE";
const WATCHER_FILE: &str = "WAFFLE_WATCHER_FILE";
const WATCHER_INTERVAL: &str = "WAFFLE_WATCHER_INTERVAL";
const REDIS_HOST: &str = "WAFFLE_REDIS_HOST";
const REDIS_PORT: &str = "WAFFLE_REDIS_PORT";
const REDIS_CHANNEL: &str = "WAFFLE_REDIS_CHANNEL";
const RESERVED_PREFIX: &str = "WAFFLE_RESERVED_PREFIX";

/// Change-propagation strategy selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatchStrategy {
    /// Sentinel-file mtime polling.
    #[default]
    File,
    /// Redis publish/subscribe.
    Redis,
    /// `PostgreSQL` LISTEN/NOTIFY.
    Postgres,
}

impl WatchStrategy {
    /// Selector string for the strategy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Redis => "redis",
            Self::Postgres => "postgres",
        }
    }
}

impl FromStr for WatchStrategy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "redis" => Ok(Self::Redis),
            "postgres" | "pg" => Ok(Self::Postgres),
            _ => Err(ConfigError::InvalidSetting {
                field: WATCHER_TYPE,
                value: Some(value.to_string()),
                reason: "unknown watcher type",
            }),
        }
    }
}

/// Toggles controlling multi-process behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaffleSettings {
    /// Whether changes propagate to sibling processes.
    pub multiproc: bool,
    /// Propagation strategy.
    pub strategy: WatchStrategy,
    /// Sentinel file for the polling strategy.
    pub watcher_file: PathBuf,
    /// Sentinel polling period.
    pub poll_interval: Duration,
    /// Redis host.
    pub redis_host: String,
    /// Redis port.
    pub redis_port: u16,
    /// Pub/sub channel, shared by the Redis and `PostgreSQL` strategies.
    pub channel: String,
    /// Prefix of keys that are never user-editable.
    pub reserved_prefix: String,
}

impl Default for WaffleSettings {
    fn default() -> Self {
        Self {
            multiproc: false,
            strategy: WatchStrategy::File,
            watcher_file: PathBuf::from(DEFAULT_WATCHER_FILE),
            poll_interval: DEFAULT_POLL_INTERVAL,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            channel: DEFAULT_CHANNEL.to_string(),
            reserved_prefix: DEFAULT_RESERVED_PREFIX.to_string(),
        }
    }
}

impl WaffleSettings {
    /// Read toggles from a host configuration map; absent keys keep defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSetting`] for unparsable toggles.
    pub fn from_host_config(config: &BTreeMap<String, Value>) -> ConfigResult<Self> {
        Self::from_lookup(|name| {
            config.get(name).and_then(|value| match value {
                Value::Null => None,
                Value::String(text) => Some(text.clone()),
                other => Some(other.to_string()),
            })
        })
    }

    /// Read toggles from the process environment; absent variables keep defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSetting`] for unparsable toggles.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read toggles through an arbitrary lookup function.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSetting`] for unparsable toggles.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let mut settings = Self::default();
        if let Some(raw) = lookup(MULTIPROC) {
            settings.multiproc = parse_flag(&raw);
        }
        if let Some(raw) = lookup(WATCHER_TYPE) {
            settings.strategy = raw.parse()?;
        }
        if let Some(raw) = lookup(WATCHER_FILE).filter(|raw| !raw.trim().is_empty()) {
            settings.watcher_file = PathBuf::from(raw);
        }
        if let Some(raw) = lookup(WATCHER_INTERVAL) {
            settings.poll_interval = parse_interval(&raw)?;
        }
        if let Some(raw) = lookup(REDIS_HOST).filter(|raw| !raw.trim().is_empty()) {
            settings.redis_host = raw;
        }
        if let Some(raw) = lookup(REDIS_PORT) {
            settings.redis_port = raw.trim().parse().map_err(|_| ConfigError::InvalidSetting {
                field: REDIS_PORT,
                value: Some(raw.clone()),
                reason: "port must be an integer between 0 and 65535",
            })?;
        }
        if let Some(raw) = lookup(REDIS_CHANNEL).filter(|raw| !raw.trim().is_empty()) {
            settings.channel = raw;
        }
        if let Some(raw) = lookup(RESERVED_PREFIX) {
            settings.reserved_prefix = raw;
        }
        Ok(settings)
    }

    /// Key filter for the configured reserved prefix.
    #[must_use]
    pub fn key_filter(&self) -> KeyFilter {
        KeyFilter::new(self.reserved_prefix.clone())
    }

    /// Strategy to attach, or `None` in single-process mode.
    ///
    /// `pool` is required by the `postgres` strategy. When Redis support is not
    /// compiled in, the `redis` selector falls back to the sentinel file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSetting`] when the `postgres` strategy is
    /// selected without a database pool.
    pub fn sync_backend(&self, pool: Option<&PgPool>) -> ConfigResult<Option<SyncBackend>> {
        if !self.multiproc {
            return Ok(None);
        }
        let backend = match self.strategy {
            WatchStrategy::File => self.file_backend(),
            WatchStrategy::Redis => self.redis_backend(),
            WatchStrategy::Postgres => {
                let pool = pool.ok_or(ConfigError::InvalidSetting {
                    field: WATCHER_TYPE,
                    value: Some(WatchStrategy::Postgres.as_str().to_string()),
                    reason: "postgres watcher requires a database store",
                })?;
                SyncBackend::Postgres {
                    pool: pool.clone(),
                    channel: self.channel.clone(),
                }
            }
        };
        Ok(Some(backend))
    }

    fn file_backend(&self) -> SyncBackend {
        SyncBackend::File {
            path: self.watcher_file.clone(),
            interval: self.poll_interval,
        }
    }

    #[cfg(feature = "redis")]
    fn redis_backend(&self) -> SyncBackend {
        SyncBackend::Redis {
            host: self.redis_host.clone(),
            port: self.redis_port,
            channel: self.channel.clone(),
        }
    }

    #[cfg(not(feature = "redis"))]
    fn redis_backend(&self) -> SyncBackend {
        tracing::warn!("redis support not compiled in; falling back to sentinel file watcher");
        self.file_backend()
    }
}

fn parse_interval(raw: &str) -> ConfigResult<Duration> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| ConfigError::InvalidSetting {
            field: WATCHER_INTERVAL,
            value: Some(raw.to_string()),
            reason: "interval must be a positive number of seconds",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let settings = WaffleSettings::default();
        assert!(!settings.multiproc);
        assert_eq!(settings.strategy, WatchStrategy::File);
        assert_eq!(settings.watcher_file, PathBuf::from("/tmp/waffleconf.txt"));
        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.redis_host, "localhost");
        assert_eq!(settings.redis_port, 6379);
        assert_eq!(settings.channel, "waffleconf");
        assert!(settings.key_filter().is_reserved("WAFFLE_MULTIPROC"));
    }

    #[test]
    fn host_config_overrides_defaults() -> anyhow::Result<()> {
        let config = BTreeMap::from([
            ("WAFFLE_MULTIPROC".to_string(), json!(true)),
            ("WAFFLE_WATCHER_TYPE".to_string(), json!("Redis")),
            ("WAFFLE_WATCHER_INTERVAL".to_string(), json!(0.5)),
            ("WAFFLE_REDIS_PORT".to_string(), json!(6380)),
            ("WAFFLE_REDIS_CHANNEL".to_string(), json!("custom")),
            ("WAFFLE_RESERVED_PREFIX".to_string(), json!("SYS_")),
        ]);
        let settings = WaffleSettings::from_host_config(&config)?;
        assert!(settings.multiproc);
        assert_eq!(settings.strategy, WatchStrategy::Redis);
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.redis_port, 6380);
        assert_eq!(settings.channel, "custom");
        assert!(settings.key_filter().is_reserved("SYS_DEBUG"));
        assert!(!settings.key_filter().is_reserved("WAFFLE_MULTIPROC"));
        Ok(())
    }

    #[test]
    fn invalid_toggles_are_rejected() {
        let lookup = |field: &'static str, value: &'static str| {
            WaffleSettings::from_lookup(move |name| (name == field).then(|| value.to_string()))
        };
        assert!(matches!(
            lookup("WAFFLE_WATCHER_TYPE", "carrier-pigeon"),
            Err(ConfigError::InvalidSetting { field: "WAFFLE_WATCHER_TYPE", .. })
        ));
        assert!(matches!(
            lookup("WAFFLE_WATCHER_INTERVAL", "-1"),
            Err(ConfigError::InvalidSetting { field: "WAFFLE_WATCHER_INTERVAL", .. })
        ));
        assert!(matches!(
            lookup("WAFFLE_REDIS_PORT", "70000"),
            Err(ConfigError::InvalidSetting { field: "WAFFLE_REDIS_PORT", .. })
        ));
        assert!(matches!(
            lookup("WAFFLE_MULTIPROC", "off"),
            Ok(WaffleSettings { multiproc: false, .. })
        ));
    }

    #[test]
    fn strategy_aliases_parse() {
        assert_eq!("pg".parse::<WatchStrategy>().ok(), Some(WatchStrategy::Postgres));
        assert_eq!(" FILE ".parse::<WatchStrategy>().ok(), Some(WatchStrategy::File));
    }

    #[test]
    fn single_process_has_no_backend() -> anyhow::Result<()> {
        assert!(WaffleSettings::default().sync_backend(None)?.is_none());
        Ok(())
    }

    #[test]
    fn file_backend_carries_path_and_interval() -> anyhow::Result<()> {
        let settings = WaffleSettings {
            multiproc: true,
            watcher_file: PathBuf::from("/tmp/other.txt"),
            poll_interval: Duration::from_secs(2),
            ..WaffleSettings::default()
        };
        let backend = settings.sync_backend(None)?;
        assert!(matches!(
            backend,
            Some(SyncBackend::File { ref path, interval })
                if path == &PathBuf::from("/tmp/other.txt") && interval == Duration::from_secs(2)
        ));
        Ok(())
    }

    #[test]
    fn postgres_backend_requires_pool() {
        let settings = WaffleSettings {
            multiproc: true,
            strategy: WatchStrategy::Postgres,
            ..WaffleSettings::default()
        };
        assert!(matches!(
            settings.sync_backend(None),
            Err(ConfigError::InvalidSetting { reason: "postgres watcher requires a database store", .. })
        ));
    }
}
