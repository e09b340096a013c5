//! REST API Handlers
//!
//! Exposes the orchestrator-facing share lifecycle (create, delete, expand)
//! plus read-only views of instances, operations and controller status.
//! Volume ids contain `/` and must be percent-encoded in paths.

use crate::controlplane::controller::{
    ControllerStatus, DeleteOutcome, ExpandOutcome, InstanceView, MultishareController,
    OperationView, ShareProvisioned,
};
use crate::error::{Error, RetryClass};
use crate::multishare::constraints::parse_capacity;
use crate::multishare::ShareRequest;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Share create request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShareRequest {
    /// Share name, unique per instance
    pub name: String,
    /// Capacity (e.g., "100Gi", "1Ti")
    pub capacity: String,
    pub project: String,
    pub location: String,
    /// Storage-class parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Share expand request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandShareRequest {
    /// New capacity (e.g., "200Gi")
    pub capacity: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    /// Whether the same request may succeed later
    pub retryable: bool,
}

/// Error wrapper mapping controller errors to HTTP
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match (&self.0, self.0.retry_class()) {
            (Error::ResourceNotFound { .. }, _) => StatusCode::NOT_FOUND,
            (Error::Conflict { .. }, _) => StatusCode::CONFLICT,
            (Error::CapacityExhausted { .. }, _) => StatusCode::INSUFFICIENT_STORAGE,
            (_, RetryClass::NeverFits) => StatusCode::BAD_REQUEST,
            (_, RetryClass::TryAgainLater) => StatusCode::SERVICE_UNAVAILABLE,
            (_, RetryClass::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            Error::Validation(_) => "invalid_request",
            Error::MalformedIdentity { .. } => "malformed_volume_id",
            Error::Conflict { .. } => "operation_in_progress",
            Error::CapacityExhausted { .. } => "capacity_exhausted",
            Error::ResourceNotFound { .. } => "not_found",
            Error::Backend { .. } | Error::Kube(_) => "backend_unavailable",
            Error::UnknownState { .. } => "unknown_state",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }
        let body = ApiErrorResponse {
            error: self.code().into(),
            message: self.0.to_string(),
            retryable: self.0.retry_class() == RetryClass::TryAgainLater,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    controller: Arc<MultishareController>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(controller: Arc<MultishareController>) -> Self {
        Self { controller }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            controller: self.controller,
        };

        Router::new()
            // Share endpoints
            .route("/v1/shares", post(create_share))
            .route("/v1/shares/:volume_id", delete(delete_share))
            .route("/v1/shares/:volume_id/expand", post(expand_share))
            // Views
            .route("/v1/instances", get(list_instances))
            .route("/v1/operations", get(list_operations))
            .route("/v1/status", get(get_status))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    controller: Arc<MultishareController>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_share(
    State(state): State<AppState>,
    Json(request): Json<CreateShareRequest>,
) -> ApiResult<(StatusCode, Json<ShareProvisioned>)> {
    info!("Creating share {} ({})", request.name, request.capacity);
    let capacity_bytes = parse_capacity(&request.capacity)?;
    let share = ShareRequest {
        name: request.name,
        capacity_bytes,
        project: request.project,
        location: request.location,
        parameters: request.parameters,
    };

    let provisioned = state.controller.create_share(share).await?;
    let status = if provisioned.placement == "already_exists" {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(provisioned)))
}

async fn delete_share(
    State(state): State<AppState>,
    Path(volume_id): Path<String>,
) -> ApiResult<(StatusCode, Json<DeleteOutcome>)> {
    let outcome = state.controller.delete_share(&volume_id).await?;
    let status = match outcome {
        DeleteOutcome::AlreadyDeleted => StatusCode::OK,
        DeleteOutcome::Pending { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

async fn expand_share(
    State(state): State<AppState>,
    Path(volume_id): Path<String>,
    Json(request): Json<ExpandShareRequest>,
) -> ApiResult<(StatusCode, Json<ExpandOutcome>)> {
    let capacity_bytes = parse_capacity(&request.capacity)?;
    let outcome = state
        .controller
        .expand_share(&volume_id, capacity_bytes, &request.parameters)
        .await?;
    let status = match outcome {
        ExpandOutcome::Unchanged { .. } => StatusCode::OK,
        ExpandOutcome::Pending { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceView>> {
    Json(state.controller.instances())
}

async fn list_operations(State(state): State<AppState>) -> Json<Vec<OperationView>> {
    Json(state.controller.operations())
}

async fn get_status(State(state): State<AppState>) -> Json<ControllerStatus> {
    Json(state.controller.status())
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check() -> impl IntoResponse {
    (StatusCode::OK, "ready")
}
