/// Execution history endpoint

use crate::api::{api_error, workflows::AppState, ApiError};
use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<u32>,
}

pub fn create_log_routes() -> Router<AppState> {
    Router::new().route("/api/logs", get(recent_logs))
}

/// GET /api/logs?limit=N (most recent first, default 100)
async fn recent_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let logs = state.scheduler.recent_logs(limit).await.map_err(api_error)?;
    Ok(Json(json!({ "logs": logs })))
}
