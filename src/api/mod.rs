/// HTTP API layer
///
/// Thin REST surface over the engine:
/// - Workflow CRUD and manual triggers
/// - Schedule management
/// - Webhook triggers
/// - Execution history

// Workflow management endpoints (CRUD, trigger, schedule)
pub mod workflows;

// Webhook trigger endpoint
pub mod webhooks;

// Execution history endpoint
pub mod logs;

use crate::error::EngineError;
use axum::{http::StatusCode, response::Json};
use serde_json::{json, Value};

// Re-export router builders
pub use logs::create_log_routes;
pub use webhooks::create_webhook_routes;
pub use workflows::{create_workflow_routes, AppState};

/// Error half of every handler result: a status plus `{ "error": "..." }`
pub type ApiError = (StatusCode, Json<Value>);

/// Map an engine error onto a response, logging server-side failures
pub fn api_error(error: EngineError) -> ApiError {
    let status = match &error {
        EngineError::DefinitionNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::DefinitionMalformed(_) | EngineError::InvalidScheduleExpression { .. } => {
            StatusCode::BAD_REQUEST
        }
        EngineError::NotWebhookTriggered(_) | EngineError::WorkflowInactive(_) => {
            StatusCode::CONFLICT
        }
        EngineError::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!("❌ Request failed: {}", error);
    } else {
        tracing::debug!("↩️ Rejected request: {}", error);
    }

    (status, Json(json!({ "error": error.to_string() })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (EngineError::DefinitionNotFound("x".into()), StatusCode::NOT_FOUND),
            (EngineError::invalid_schedule("x", "bad"), StatusCode::BAD_REQUEST),
            (EngineError::NotWebhookTriggered("x".into()), StatusCode::CONFLICT),
            (EngineError::WorkflowInactive("x".into()), StatusCode::CONFLICT),
            (EngineError::ShutdownInProgress, StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::Scheduler("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(api_error(error).0, expected);
        }
    }
}
