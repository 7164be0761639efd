//! Shared state handed to every handler.

use waffle_config::WaffleState;
use waffle_telemetry::Metrics;

/// Dependencies the HTTP handlers operate on.
#[derive(Debug, Clone)]
pub struct ApiState {
    /// Configuration overlay served by the editing endpoints.
    pub config: WaffleState,
    /// Metrics registry exposed at `/metrics`.
    pub telemetry: Metrics,
}

impl ApiState {
    /// Bundle the overlay and metrics handle.
    #[must_use]
    pub const fn new(config: WaffleState, telemetry: Metrics) -> Self {
        Self { config, telemetry }
    }
}
