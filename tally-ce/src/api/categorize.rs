//! Batch and worker trigger endpoints

use axum::{extract::State, routing::post, Json, Router};

use crate::error::{ApiError, ApiResult};
use crate::orchestrator::{BatchRequest, BatchResponse, WorkerSummary};
use crate::AppState;

/// Largest `max_batches` accepted from a caller
pub const MAX_BATCHES_PER_CALL: u32 = 100;

/// POST /categorize/batch
///
/// Body `{org_id?, max_batches?}`; an empty body means one page across all
/// organizations.
pub async fn categorize_batch(
    State(state): State<AppState>,
    body: Option<Json<BatchRequest>>,
) -> ApiResult<Json<BatchResponse>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    if let Some(org_id) = &request.org_id {
        if org_id.trim().is_empty() {
            return Err(ApiError::BadRequest("org_id must not be empty".to_string()));
        }
    }
    if let Some(n) = request.max_batches {
        if n == 0 || n > MAX_BATCHES_PER_CALL {
            return Err(ApiError::BadRequest(format!(
                "max_batches must be between 1 and {}",
                MAX_BATCHES_PER_CALL
            )));
        }
    }

    match state.orchestrator.run_batch(request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            *state.last_error.write().await = Some(e.to_string());
            Err(ApiError::Store(e))
        }
    }
}

/// POST /categorize/worker
///
/// Runs one worker pass over every organization with backlog.
pub async fn run_worker(State(state): State<AppState>) -> ApiResult<Json<WorkerSummary>> {
    match state.orchestrator.run_worker().await {
        Ok(summary) => Ok(Json(summary)),
        Err(e) => {
            *state.last_error.write().await = Some(e.to_string());
            Err(ApiError::Store(e))
        }
    }
}

/// Build categorization routes
pub fn categorize_routes() -> Router<AppState> {
    Router::new()
        .route("/categorize/batch", post(categorize_batch))
        .route("/categorize/worker", post(run_worker))
}
