//! Awakeable resolution endpoints: thin wrappers over the engine's
//! transactional resolve/reject. No business logic beyond request parsing
//! and response shaping.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use windlass::WindlassError;

use crate::app::AppState;

#[derive(Serialize)]
pub struct AwakeableResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awakeable_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AwakeableResponse {
    fn ok(awakeable_id: String, payload: Value) -> Self {
        Self {
            success: true,
            awakeable_id: Some(awakeable_id),
            payload: Some(payload),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            awakeable_id: None,
            payload: None,
            error: Some(message.into()),
        }
    }
}

fn error_response(err: WindlassError) -> (StatusCode, Json<AwakeableResponse>) {
    let (status, message) = match &err {
        WindlassError::NotFound { .. } => (StatusCode::NOT_FOUND, err.to_string()),
        WindlassError::NotPending { .. } => (StatusCode::CONFLICT, "not pending".to_string()),
        WindlassError::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
        _ => {
            tracing::error!(error = %err, "awakeable endpoint failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
        }
    };
    (status, Json(AwakeableResponse::err(message)))
}

/// `POST /awakeables/{id}/resolve` — body is any JSON payload.
pub async fn resolve_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<AwakeableResponse>) {
    match windlass::awakeable::resolve(&id, payload.clone(), &state.store).await {
        Ok(row) => {
            tracing::info!(awakeable = %id, job_id = %row.job_id, "awakeable resolved via http");
            (StatusCode::OK, Json(AwakeableResponse::ok(id, payload)))
        }
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
pub struct RejectBody {
    pub error: String,
}

/// `POST /awakeables/{id}/reject` — body `{"error": "..."}`.
pub async fn reject_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> (StatusCode, Json<AwakeableResponse>) {
    match windlass::awakeable::reject(&id, &body.error, &state.store).await {
        Ok(row) => {
            tracing::info!(awakeable = %id, job_id = %row.job_id, "awakeable rejected via http");
            (
                StatusCode::OK,
                Json(AwakeableResponse::ok(id, serde_json::json!({ "error": body.error }))),
            )
        }
        Err(err) => error_response(err),
    }
}
