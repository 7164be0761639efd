//! HTTP surface modules (router, handlers, middleware).

/// Configuration render and update handlers.
pub mod config;
pub(crate) mod constants;
/// Problem response helpers and error types.
pub mod errors;
/// Health and diagnostics endpoints.
pub mod health;
/// Router construction and server host.
pub mod router;
/// Metrics middleware for HTTP requests.
pub(crate) mod telemetry;
