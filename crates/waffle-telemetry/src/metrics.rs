//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Each `Metrics` owns its registry so tests never collide on global state.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    http_requests_total: IntCounterVec,
    config_updates_total: IntCounter,
    config_keys_applied_total: IntCounter,
    config_update_failures_total: IntCounter,
}

/// Snapshot of the configuration counters for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Update batches that changed at least one key.
    pub config_updates_total: u64,
    /// Keys written across all update batches.
    pub config_keys_applied_total: u64,
    /// Update requests that failed.
    pub config_update_failures_total: u64,
}

fn counter(name: &'static str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests received"),
            &["route", "code"],
        )
        .map_err(|source| TelemetryError::MetricsCollector {
            name: "http_requests_total",
            source,
        })?;
        let config_updates_total = counter(
            "config_updates_total",
            "Configuration update batches that changed at least one key",
        )?;
        let config_keys_applied_total = counter(
            "config_keys_applied_total",
            "Configuration keys written by update batches",
        )?;
        let config_update_failures_total =
            counter("config_update_failures_total", "Configuration update failures")?;

        register(&registry, "http_requests_total", &http_requests_total)?;
        register(&registry, "config_updates_total", &config_updates_total)?;
        register(
            &registry,
            "config_keys_applied_total",
            &config_keys_applied_total,
        )?;
        register(
            &registry,
            "config_update_failures_total",
            &config_update_failures_total,
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                http_requests_total,
                config_updates_total,
                config_keys_applied_total,
                config_update_failures_total,
            }),
        })
    }

    /// Increment the HTTP request counter for the given route and status code.
    pub fn inc_http_request(&self, route: &str, status: u16) {
        self.inner
            .http_requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    /// Record an update batch that wrote `keys` keys; empty batches are ignored.
    pub fn record_config_update(&self, keys: usize) {
        if keys == 0 {
            return;
        }
        self.inner.config_updates_total.inc();
        self.inner
            .config_keys_applied_total
            .inc_by(u64::try_from(keys).unwrap_or(u64::MAX));
    }

    /// Increment the configuration update failure counter.
    pub fn inc_config_update_failure(&self) {
        self.inner.config_update_failures_total.inc();
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the configuration counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            config_updates_total: self.inner.config_updates_total.get(),
            config_keys_applied_total: self.inner.config_keys_applied_total.get(),
            config_update_failures_total: self.inner.config_update_failures_total.get(),
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Metrics")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_snapshot_reflects_updates() -> Result<()> {
        let metrics = Metrics::new()?;
        metrics.inc_http_request("/health", 200);
        metrics.record_config_update(3);
        metrics.record_config_update(0);
        metrics.record_config_update(1);
        metrics.inc_config_update_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.config_updates_total, 2);
        assert_eq!(snapshot.config_keys_applied_total, 4);
        assert_eq!(snapshot.config_update_failures_total, 1);

        let rendered = metrics.render()?;
        assert!(rendered.contains("http_requests_total"));
        assert!(rendered.contains("config_keys_applied_total 4"));
        Ok(())
    }

    #[test]
    fn registries_are_independent() -> Result<()> {
        let first = Metrics::new()?;
        let second = Metrics::new()?;
        first.record_config_update(1);
        assert_eq!(second.snapshot().config_updates_total, 0);
        Ok(())
    }
}
