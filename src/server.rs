//! Minimal HTTP surface for operators: a liveness probe.
//!
//! The bot's real work happens in the poll loop; this server only exists so
//! orchestration systems can tell the process is alive.

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

/// Builds the operator-facing router.
pub fn router() -> Router {
    Router::new().route("/health", get(health_handler))
}

/// Health check handler. Returns 200 OK with the text "OK".
async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
