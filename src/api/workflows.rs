/// Workflow management REST API endpoints
///
/// CRUD for workflow definitions plus manual triggers and schedule changes.
/// Every write invalidates the cached definition and brings the scheduler's
/// job table in line with the stored trigger.

use crate::{
    api::{api_error, ApiError},
    error::EngineError,
    runtime::scheduler::{validate_cron_expression, RunAcceptance, ScheduledJob, WorkflowScheduler},
    workflow::{
        cache::CachedDefinitions,
        storage::WorkflowStore,
        types::{Trigger, WorkflowDefinition},
    },
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Workflow storage for persistence
    pub store: WorkflowStore,
    /// Read-through cache the workers load definitions from
    pub cache: Arc<CachedDefinitions>,
    /// Job scheduler and work queue
    pub scheduler: Arc<WorkflowScheduler>,
}

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
    /// The job registered for a cron workflow, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduledJob>,
}

/// Body of PUT /api/workflows/{id}/schedule
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub expression: String,
}

/// Create workflow management routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/trigger", post(trigger_workflow))
        .route(
            "/api/workflows/{id}/schedule",
            put(set_schedule).delete(clear_schedule),
        )
        .route("/api/schedules", get(list_schedules))
}

/// Create a new workflow
///
/// POST /api/workflows
/// Body: { "id": "...", "name": "...", "trigger": {...}, "steps": [...] }
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<WorkflowResponse>), ApiError> {
    let workflow = WorkflowDefinition::from_json(payload).map_err(api_error)?;
    if let Some(expression) = workflow.cron_expression() {
        validate_cron_expression(expression).map_err(api_error)?;
    }

    if state.store.get_workflow(&workflow.id).await.map_err(api_error)?.is_some() {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("workflow '{}' already exists", workflow.id) })),
        ));
    }

    state.store.save_workflow(&workflow).await.map_err(api_error)?;
    state.cache.invalidate(&workflow.id);
    let schedule = sync_schedule(&state, &workflow).await?;

    tracing::info!("🔥 Created workflow: {} ({})", workflow.id, workflow.name);

    Ok((
        StatusCode::CREATED,
        Json(WorkflowResponse {
            id: workflow.id.clone(),
            message: format!("Workflow '{}' created successfully", workflow.name),
            schedule,
        }),
    ))
}

/// List all workflows
///
/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let workflows = state.store.list_workflows().await.map_err(api_error)?;
    Ok(Json(json!({ "workflows": workflows })))
}

/// Get a specific workflow by ID
///
/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    state
        .store
        .get_workflow(&id)
        .await
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| api_error(EngineError::DefinitionNotFound(id)))
}

/// Replace an existing workflow
///
/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut payload): Json<Value>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    // The URL wins over whatever id the body carries
    if let Some(body) = payload.as_object_mut() {
        body.insert("id".to_string(), Value::String(id.clone()));
    }
    let workflow = WorkflowDefinition::from_json(payload).map_err(api_error)?;
    if let Some(expression) = workflow.cron_expression() {
        validate_cron_expression(expression).map_err(api_error)?;
    }

    if state.store.get_workflow(&id).await.map_err(api_error)?.is_none() {
        return Err(api_error(EngineError::DefinitionNotFound(id)));
    }

    state.store.save_workflow(&workflow).await.map_err(api_error)?;
    state.cache.invalidate(&workflow.id);
    let schedule = sync_schedule(&state, &workflow).await?;

    tracing::info!("🔥 Updated workflow: {} ({})", workflow.id, workflow.name);

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        message: format!("Workflow '{}' updated successfully", workflow.name),
        schedule,
    }))
}

/// Delete a workflow and its schedule
///
/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.scheduler.unschedule(&id).await.map_err(api_error)?;
    let deleted = state.store.delete_workflow(&id).await.map_err(api_error)?;
    state.cache.invalidate(&id);

    if !deleted {
        return Err(api_error(EngineError::DefinitionNotFound(id)));
    }

    tracing::info!("🗑️ Deleted workflow: {}", id);
    Ok(Json(json!({ "message": "Workflow deleted successfully" })))
}

/// Queue a manual run
///
/// POST /api/workflows/{id}/trigger → 202 with the run acceptance
async fn trigger_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RunAcceptance>), ApiError> {
    let accepted = state.scheduler.trigger_now(&id).await.map_err(api_error)?;
    tracing::info!("🚀 Manual trigger accepted for {}", id);
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// Put a workflow on a cron schedule and persist the trigger
///
/// Inactive workflows are refused with 409 so the job table never holds a
/// schedule that startup reconciliation would drop.
///
/// PUT /api/workflows/{id}/schedule
/// Body: { "expression": "0 9 * * 1-5" }
async fn set_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<ScheduledJob>, ApiError> {
    validate_cron_expression(&request.expression).map_err(api_error)?;

    let mut workflow = state
        .store
        .get_workflow(&id)
        .await
        .map_err(api_error)?
        .ok_or_else(|| api_error(EngineError::DefinitionNotFound(id.clone())))?;
    if !workflow.active {
        return Err(api_error(EngineError::WorkflowInactive(id)));
    }

    let job = state
        .scheduler
        .schedule(&id, &request.expression)
        .await
        .map_err(api_error)?;

    workflow.trigger = Trigger::Cron {
        expression: request.expression.trim().to_string(),
    };
    state.store.save_workflow(&workflow).await.map_err(api_error)?;
    state.cache.invalidate(&id);

    Ok(Json(job))
}

/// Remove a workflow's schedule; a cron workflow falls back to manual
///
/// DELETE /api/workflows/{id}/schedule
async fn clear_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.scheduler.unschedule(&id).await.map_err(api_error)?;

    if let Some(mut workflow) = state.store.get_workflow(&id).await.map_err(api_error)? {
        if workflow.cron_expression().is_some() {
            workflow.trigger = Trigger::Manual;
            state.store.save_workflow(&workflow).await.map_err(api_error)?;
            state.cache.invalidate(&id);
        }
    }

    Ok(Json(json!({ "workflow_id": id, "removed": removed })))
}

/// GET /api/schedules
async fn list_schedules(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "schedules": state.scheduler.jobs().await }))
}

/// Register or remove the job so the table matches the stored trigger
async fn sync_schedule(
    state: &AppState,
    workflow: &WorkflowDefinition,
) -> Result<Option<ScheduledJob>, ApiError> {
    match workflow.cron_expression() {
        Some(expression) if workflow.active => state
            .scheduler
            .schedule(&workflow.id, expression)
            .await
            .map(Some)
            .map_err(api_error),
        _ => {
            state.scheduler.unschedule(&workflow.id).await.map_err(api_error)?;
            Ok(None)
        }
    }
}
