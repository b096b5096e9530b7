/// Instance REST API endpoints
///
/// Form submission, search, inspection, deletion and the event log.

use crate::api::{ok_results, ApiResult, AppState};
use crate::error::EngineError;
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

pub fn create_instance_routes() -> Router<AppState> {
    Router::new()
        .route("/instance", get(search_instances))
        .route("/instance/{instance_id}", get(instance_info).delete(delete_instance))
        .route("/instance/{instance_id}/task/{task_id}", get(task_info))
        .route("/instance/{instance_id}/task/{task_id}/form", post(submit_form))
        .route("/events", get(all_events))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
}

/// POST /instance/{instance_id}/task/{task_id}/form
/// Body: { "field": value, ... }
async fn submit_form(
    State(state): State<AppState>,
    Path((instance_id, task_id)): Path<(String, String)>,
    Json(fields): Json<Map<String, Value>>,
) -> ApiResult {
    state.service.submit_form(&instance_id, &task_id, fields)?;
    Ok(Json(json!({ "status": "ok" })))
}

/// GET /instance?q=attribute:value,...
async fn search_instances(State(state): State<AppState>, Query(params): Query<SearchParams>) -> ApiResult {
    let query = params
        .q
        .ok_or_else(|| EngineError::InvalidQuery("missing 'q' parameter".to_string()))?;
    ok_results(state.service.search(&query).await?)
}

/// GET /instance/{instance_id}
async fn instance_info(State(state): State<AppState>, Path(instance_id): Path<String>) -> ApiResult {
    Ok(Json(state.service.instance_info(&instance_id).await?))
}

/// GET /instance/{instance_id}/task/{task_id}
async fn task_info(
    State(state): State<AppState>,
    Path((instance_id, task_id)): Path<(String, String)>,
) -> ApiResult {
    Ok(Json(state.service.task_info(&instance_id, &task_id)?))
}

/// DELETE /instance/{instance_id}
async fn delete_instance(State(state): State<AppState>, Path(instance_id): Path<String>) -> ApiResult {
    state.service.delete_instance(&instance_id).await?;
    Ok(Json(json!({ "status": "ok", "message": "Instance deleted successfully." })))
}

/// GET /events
async fn all_events(State(state): State<AppState>) -> ApiResult {
    ok_results(state.service.all_events().await?)
}
