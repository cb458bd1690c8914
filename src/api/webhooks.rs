/// Webhook trigger endpoint
///
/// POST /webhook/{workflow_id} queues a run of a webhook-triggered workflow.
/// The JSON body becomes the trigger payload that conditions can inspect.

use crate::api::{api_error, workflows::AppState, ApiError};
use crate::runtime::scheduler::RunAcceptance;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde_json::{json, Value};

/// Create webhook routes
pub fn create_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook/{workflow_id}", post(execute_webhook))
}

/// Queue a workflow run from a webhook
///
/// 202 when queued, 404 for unknown workflows, 409 when the workflow is not
/// webhook-triggered, 400 for a body that is not JSON.
async fn execute_webhook(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<RunAcceptance>), ApiError> {
    tracing::info!("📥 Webhook request received: {}", workflow_id);
    tracing::debug!("📄 Request body: {}", body);

    // Parse JSON body manually so an empty body is an empty payload
    let payload: Value = if body.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(&body).map_err(|e| {
            tracing::warn!("❌ Invalid JSON payload for webhook {}: {}", workflow_id, e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid JSON body: {e}") })),
            )
        })?
    };

    let accepted = state
        .scheduler
        .trigger_webhook(&workflow_id, payload)
        .await
        .map_err(api_error)?;

    tracing::info!("🚀 Webhook run {} queued for {}", accepted.request_id, workflow_id);
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}
