//! Error types for the categorization engine
//!
//! Engine errors never escape a transaction: each is converted to a degraded
//! result at the boundary that owns it. Only the HTTP trigger surfaces errors
//! to callers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Rule-store / persistence adapter error
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored row could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Pass-1 scoring error (caught inside Pass-1)
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("Malformed rule {rule_id}: {reason}")]
    MalformedRule { rule_id: String, reason: String },
}

/// Generative model provider error
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// Upstream asked us to slow down
    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

/// API error type for the HTTP trigger
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Store(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORE_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
