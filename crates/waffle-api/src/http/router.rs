//! Router construction and server host for the API.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tracing::info;
use waffle_config::WaffleState;
use waffle_telemetry::{Metrics, http_trace_layer};

use crate::error::{ApiServerError, ApiServerResult};
use crate::http::config::{get_config, update_config};
use crate::http::health::{health, metrics};
use crate::http::telemetry::HttpMetricsLayer;
use crate::state::ApiState;

/// Axum router wrapper that hosts the configuration editing endpoints.
pub struct ApiServer {
    router: Router,
}

impl ApiServer {
    /// Construct a server over the overlay and metrics registry.
    #[must_use]
    pub fn new(config: WaffleState, telemetry: Metrics) -> Self {
        let state = Arc::new(ApiState::new(config, telemetry.clone()));
        let layered = ServiceBuilder::new()
            .layer(http_trace_layer())
            .layer(HttpMetricsLayer::new(telemetry));
        let router = Self::build_router()
            .route_layer(layered)
            .with_state(state);
        Self { router }
    }

    fn build_router() -> Router<Arc<ApiState>> {
        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics))
            .route("/waffle/config", get(get_config).post(update_config))
    }

    /// Underlying router, for embedding into a host application or driving in tests.
    #[must_use]
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve the API on `addr` until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails to bind or the server terminates unexpectedly.
    pub async fn serve(
        self,
        addr: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> ApiServerResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ApiServerError::Bind { addr, source })?;
        info!(%addr, "serving configuration api");
        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|source| ApiServerError::Serve { source })
    }
}
