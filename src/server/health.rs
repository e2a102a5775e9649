//! Health Routes
//!
//! - GET /health - Plain "OK"
//! - GET /health/live - Liveness probe
//! - GET /health/status - Connection count and uptime

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use super::state::AppState;

/// Body of `/health/status`
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub connections: usize,
    pub uptime_seconds: u64,
    pub version: String,
}

/// GET /health
pub async fn health() -> &'static str {
    "OK"
}

/// GET /health/live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "healthy".to_string(),
        connections: state.connection_count().await,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
