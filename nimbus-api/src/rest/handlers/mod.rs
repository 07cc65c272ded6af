mod nodes;
mod vms;

use axum::http::HeaderMap;
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::audit::ApiAuditLogger;
use crate::auth;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::scheduler::Scheduler;
use crate::services::node::NodeService;
use crate::services::ports::DirectAccessService;
use crate::services::vm::VmService;
use crate::store::DataStore;

pub use nodes::*;
pub use vms::*;

/// Shared application state
pub struct AppState {
    pub store: Arc<DataStore>,
    pub config: Arc<OrchestratorConfig>,
    pub nodes: Arc<NodeService>,
    pub vms: Arc<VmService>,
    pub ports: Arc<DirectAccessService>,
    pub scheduler: Scheduler,
    pub audit: Arc<ApiAuditLogger>,
}

/// API error response: a stable machine-readable code plus a human
/// message.
#[derive(Serialize, ToSchema)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.code.as_str() {
            "argument" => StatusCode::BAD_REQUEST,
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "quota_exceeded" => StatusCode::FORBIDDEN,
            "not_found" => StatusCode::NOT_FOUND,
            "failed_precondition" => StatusCode::PRECONDITION_FAILED,
            "protocol" => StatusCode::CONFLICT,
            "no_capacity" => StatusCode::SERVICE_UNAVAILABLE,
            "external" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Bearer-token authorization for node-facing endpoints. The credential
/// must verify as a JWT for this node and match the stored salted hash.
pub async fn authorize_node(
    state: &AppState,
    headers: &HeaderMap,
    node_id: &str,
) -> Result<(), ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::new("unauthorized", "missing bearer token"))?;

    let claims = auth::verify_node_token(&state.config.jwt, token).map_err(ApiError::from)?;
    if claims.sub != node_id {
        return Err(ApiError::new(
            "unauthorized",
            "credential does not match node",
        ));
    }
    let node = state
        .store
        .get_node(node_id)
        .await
        .ok_or_else(|| ApiError::new("not_found", format!("node {}", node_id)))?;
    if !auth::verify_api_key(token, &node.api_key_hash) {
        return Err(ApiError::new("unauthorized", "credential has been rotated"));
    }
    Ok(())
}

/// Version information
#[derive(Serialize, ToSchema)]
pub struct VersionInfo {
    pub version: String,
}

/// Get service version
#[utoipa::path(
    get,
    path = "/v1/version",
    responses(
        (status = 200, description = "Service version", body = VersionInfo)
    ),
    tag = "system"
)]
pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
