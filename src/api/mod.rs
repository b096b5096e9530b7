/// HTTP API Layer
///
/// Thin axum adapter over `ProcessService`. It handles:
/// - Model listing and raw definition download
/// - Instance creation, form submission, search, inspection and deletion
/// - Event log export
///
/// Errors are rendered as `{ "status": "error", "message": ... }`.

// Model endpoints (/model/*)
pub mod models;

// Instance and event endpoints (/instance/*, /events)
pub mod instances;

use crate::error::EngineError;
use crate::service::ProcessService;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub service: ProcessService,
}

/// Engine error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidQuery(_) | EngineError::Parse(_) => StatusCode::BAD_REQUEST,
            EngineError::TaskExecution(_) => StatusCode::BAD_GATEWAY,
            EngineError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!("❌ Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }

        let body = json!({
            "status": "error",
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult = Result<Json<Value>, ApiError>;

/// `{ "status": "ok", "results": ... }`
pub fn ok_results(results: impl serde::Serialize) -> ApiResult {
    Ok(Json(json!({ "status": "ok", "results": results })))
}

pub use instances::create_instance_routes;
pub use models::create_model_routes;
