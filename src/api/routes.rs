//! API route definitions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{error, info};

use super::state::AppState;
use crate::job::{ExecutionJob, JobRequest};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/executions", post(submit_execution))
        .route("/executions/{id}/stop", post(stop_execution))
        .route("/executions/{id}/ports", get(execution_ports))
        .route("/executions/{id}/status", get(execution_status))
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m),
            ApiError::Internal(e) => {
                error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": { "code": code, "message": message } }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": { "status": "ok" },
        "meta": meta()
    }))
}

/// Accept a job and run it in the background.
async fn submit_execution(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: JobRequest =
        serde_json::from_value(body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let job = ExecutionJob::from_request(request, state.secret_key.clone())
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let id = job.id.clone();

    if !state.launch(job)? {
        return Err(ApiError::Conflict(format!("execution {id} is already running")));
    }
    info!(job_id = %id, "execution accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "execution_id": id }, "meta": meta() })),
    ))
}

async fn stop_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.deps.stop_flags.request_stop(&id)?;
    info!(job_id = %id, "stop requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "execution_id": id, "stop_requested": true }, "meta": meta() })),
    ))
}

async fn execution_ports(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let ports = state
        .deps
        .store
        .ports_for(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("no ports recorded for {id}")))?;
    Ok(Json(json!({ "data": ports, "meta": meta() })))
}

async fn execution_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state
        .deps
        .store
        .status_for(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown execution {id}")))?;
    Ok(Json(json!({ "data": status, "meta": meta() })))
}
