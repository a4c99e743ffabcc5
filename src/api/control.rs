//! Registration, debug view, metrics and health on the control address

use super::{error_response, ApiState};
use crate::cluster::RegisterRequest;
use crate::Error;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

/// POST /register_config
pub async fn register_config(State(state): State<ApiState>, body: Bytes) -> Response {
    let request: RegisterRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(&Error::Validation(format!(
                "malformed registration body: {}",
                e
            )))
        }
    };

    match state.control.register_config(request).await {
        Ok(plan) => Json(plan).into_response(),
        Err(e) => {
            warn!(error = %e, "Registration failed");
            error_response(&e)
        }
    }
}

/// GET /debug-state
pub async fn debug_state(State(state): State<ApiState>) -> Response {
    Json(state.control.debug_state()).into_response()
}

/// GET /metrics
pub async fn metrics(State(state): State<ApiState>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "partitions_active": state.table().len(),
    }))
    .into_response()
}
