//! REST API handlers.
//!
//! Each handler calls into the `PoolController` and wraps the outcome in
//! the `ApiResponse` envelope.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use cloudpool_core::ServiceState;
use cloudpool_engine::{EngineError, EngineResult};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidArgument(_) | EngineError::ScaleIn(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Driver(_) => StatusCode::BAD_GATEWAY,
        EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: EngineResult<T>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!(error = %e, %status, "pool request failed");
            }
            error_response(&e.to_string(), status).into_response()
        }
    }
}

/// Acknowledgement for per-machine actions.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MachineAction {
    machine_id: String,
    action: &'static str,
}

fn acknowledge(result: EngineResult<()>, machine_id: String, action: &'static str) -> Response {
    respond(result.map(|()| MachineAction { machine_id, action }))
}

// ── Pool ───────────────────────────────────────────────────────

/// GET /api/v1/pool
pub async fn get_pool(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.controller.get_pool().await)
}

/// GET /api/v1/pool/size
pub async fn get_pool_size(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.controller.get_pool_size().await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDesiredSizeRequest {
    pub desired_size: i64,
}

/// POST /api/v1/pool/size
pub async fn set_desired_size(
    State(state): State<ApiState>,
    Json(req): Json<SetDesiredSizeRequest>,
) -> impl IntoResponse {
    if let Err(e) = state.controller.set_desired_size(req.desired_size).await {
        return respond::<()>(Err(e));
    }
    respond(state.controller.get_pool_size().await)
}

/// GET /api/v1/pool/metadata
pub async fn get_pool_metadata(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.controller.get_pool_metadata())
}

/// GET /api/v1/pool/terminations
pub async fn pending_terminations(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.controller.pending_terminations().await)
}

// ── Machines ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRequest {
    #[serde(default)]
    pub decrement_desired_size: bool,
}

/// POST /api/v1/pool/{id}/terminate
pub async fn terminate_machine(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<MembershipRequest>,
) -> impl IntoResponse {
    let result = state
        .controller
        .terminate_machine(&id, req.decrement_desired_size)
        .await;
    acknowledge(result, id, "terminated")
}

/// POST /api/v1/pool/{id}/attach
pub async fn attach_machine(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = state.controller.attach_machine(&id).await;
    acknowledge(result, id, "attached")
}

/// POST /api/v1/pool/{id}/detach
pub async fn detach_machine(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<MembershipRequest>,
) -> impl IntoResponse {
    let result = state
        .controller
        .detach_machine(&id, req.decrement_desired_size)
        .await;
    acknowledge(result, id, "detached")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStateRequest {
    pub service_state: ServiceState,
}

/// POST /api/v1/pool/{id}/serviceState
pub async fn set_service_state(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ServiceStateRequest>,
) -> impl IntoResponse {
    let result = state
        .controller
        .set_service_state(&id, req.service_state)
        .await;
    acknowledge(result, id, "serviceStateSet")
}

#[derive(Debug, Deserialize)]
pub struct TagRequest {
    pub tags: HashMap<String, String>,
}

/// POST /api/v1/pool/{id}/tags
pub async fn tag_machine(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<TagRequest>,
) -> impl IntoResponse {
    if req.tags.is_empty() {
        return error_response("tags cannot be empty", StatusCode::BAD_REQUEST).into_response();
    }
    let result = state.controller.tag_machine(&id, &req.tags).await;
    acknowledge(result, id, "tagged")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UntagRequest {
    pub tag_keys: Vec<String>,
}

/// DELETE /api/v1/pool/{id}/tags
pub async fn untag_machine(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<UntagRequest>,
) -> impl IntoResponse {
    let result = state.controller.untag_machine(&id, &req.tag_keys).await;
    acknowledge(result, id, "untagged")
}
