/// Model REST API endpoints
///
/// Lists loaded BPMN models, serves their raw XML and starts new instances.

use crate::api::{ok_results, ApiError, ApiResult, AppState};
use crate::error::EngineError;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::{json, Map, Value};

pub fn create_model_routes() -> Router<AppState> {
    Router::new()
        .route("/model", get(list_models))
        .route("/model/{model_name}", get(get_model))
        .route("/model/{model_name}/instance", post(create_instance))
}

/// GET /model
async fn list_models(State(state): State<AppState>) -> ApiResult {
    ok_results(state.service.list_models()?)
}

/// GET /model/{model_name}
/// Returns the BPMN document as application/xml
async fn get_model(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let source = state.service.model_source(&model_name)?;
    Ok(([(header::CONTENT_TYPE, "application/xml")], source.to_string()))
}

/// POST /model/{model_name}/instance
/// Body (optional): { "variable": value, ... }
async fn create_instance(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
    body: Bytes,
) -> ApiResult {
    let variables = parse_variables(&body)?;
    let id = state.service.create_instance(&model_name, variables).await?;

    tracing::info!("🆕 Instance {} created via API for {}", id, model_name);
    Ok(Json(json!({ "status": "ok", "id": id })))
}

/// Empty body and `null` mean no initial variables; anything else must be an object
fn parse_variables(body: &[u8]) -> Result<Option<Map<String, Value>>, EngineError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(Value::Null) => Ok(None),
        Ok(_) => Err(EngineError::Parse("request body must be a JSON object".to_string())),
        Err(e) => Err(EngineError::Parse(format!("invalid JSON body: {}", e))),
    }
}
