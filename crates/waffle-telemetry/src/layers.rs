//! Tower layers shared by HTTP surfaces.

use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::TraceLayer;

/// Request/response tracing layer emitting spans through `tracing`.
#[must_use]
pub fn http_trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_layer_can_be_constructed() {
        let _layer = http_trace_layer();
    }
}
