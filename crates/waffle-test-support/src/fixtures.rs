//! Test fixtures and environment helpers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};
use url::Url;

static CHANNEL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Schema document covering every supported value type plus a reserved key.
#[must_use]
pub fn schema_document() -> Value {
    json!({
        "MAX_USERS": { "type": "int", "desc": "Maximum concurrent users", "default": 10 },
        "SITE_NAME": { "type": "str", "desc": "Public site title", "default": "Waffle" },
        "RATIO": { "type": "float", "desc": "Sampling ratio", "default": 0.5 },
        "MAINTENANCE": { "type": "bool", "desc": "Maintenance mode", "default": false },
        "FEATURES": {
            "type": "json",
            "desc": "Feature flags",
            "default": { "beta": true, "limits": [1, 2, 3] }
        },
        "WAFFLE_MULTIPROC": { "type": "bool", "desc": "Framework toggle", "default": true }
    })
}

/// Single-key schema used by the end-to-end scenario.
#[must_use]
pub fn max_users_schema() -> Value {
    json!({
        "MAX_USERS": { "type": "int", "desc": "Maximum concurrent users", "default": 10 }
    })
}

/// Channel name that will not collide with concurrently running tests.
#[must_use]
pub fn unique_channel(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let sequence = CHANNEL_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{nanos}_{sequence}", std::process::id())
}

/// Environment variable naming the Redis server used by pub/sub tests.
pub const TEST_REDIS_ENV: &str = "WAFFLE_TEST_REDIS_URL";

/// Redis host and port for pub/sub integration tests, when one is configured.
#[must_use]
pub fn redis_endpoint() -> Option<(String, u16)> {
    let raw = std::env::var(TEST_REDIS_ENV).ok()?;
    parse_redis_endpoint(&raw)
}

fn parse_redis_endpoint(raw: &str) -> Option<(String, u16)> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_string();
    Some((host, url.port().unwrap_or(6379)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_document_declares_reserved_key() {
        let schema = schema_document();
        assert!(schema.get("WAFFLE_MULTIPROC").is_some());
        assert_eq!(schema["MAX_USERS"]["default"], json!(10));
    }

    #[test]
    fn unique_channel_never_repeats() {
        let first = unique_channel("waffle");
        let second = unique_channel("waffle");
        assert_ne!(first, second);
        assert!(first.starts_with("waffle_"));
    }

    #[test]
    fn redis_endpoint_parses_host_and_port() {
        assert_eq!(
            parse_redis_endpoint("redis://cache.local:6380/0"),
            Some(("cache.local".to_string(), 6380))
        );
        assert_eq!(
            parse_redis_endpoint("redis://127.0.0.1"),
            Some(("127.0.0.1".to_string(), 6379))
        );
        assert_eq!(parse_redis_endpoint("not a url"), None);
    }
}
