//! Health check endpoint
//!
//! Always answers 200; `status` is `degraded` while Pass-2 has no API key
//! (every uncertain transaction gets the fallback) or after a batch failed.

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

pub const STATUS_OK: &str = "ok";
pub const STATUS_DEGRADED: &str = "degraded";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`
    pub status: &'static str,
    pub module: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub llm_configured: bool,
    /// Organizations currently holding a concurrency slot, summed
    pub in_flight: usize,
    /// Last failed batch or worker call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds()
        .max(0) as u64;
    let last_error = state.last_error.read().await.clone();
    let llm_configured = state.orchestrator.llm_configured();

    let status = if llm_configured && last_error.is_none() {
        STATUS_OK
    } else {
        STATUS_DEGRADED
    };

    Json(HealthResponse {
        status,
        module: "tally-ce",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds,
        llm_configured,
        in_flight: state.orchestrator.limiter().global_in_flight(),
        last_error,
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
