//! Partition control plane over HTTP.
//!
//! - GET /health, GET /metrics
//! - GET|POST /v1/partitions, GET /v1/partitions/profiles,
//!   GET /v1/partitions/capacity/{profile}
//! - GET|POST /v1/partitions/{gpu}/compute and friends
//! - GET|POST /v1/subscriptions, DELETE /v1/subscriptions/{id}
//! - POST /v1/mode
//! - GET /v1/events (SSE)
//!
//! Callers name themselves with `x-client-id`. With an admin token
//! configured, only `authorization: Bearer <token>` is privileged.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::control::{
    Caller, ComputePartitionReport, ComputeProfileReport, GpuPartitionReport, PartitionEntry, ProfileReport,
    SharedControlPlane, SubscriptionReport,
};
use crate::error::PartitionError;
use crate::metrics::Metrics;
use crate::partition::compute::{ComputeExport, ComputeRequest};
use crate::partition::manager::GpuCapacity;
use crate::persist::strategy::RestoreOutcome;
use crate::server::events::partition_events_to_sse_stream;
use crate::topology::tree::SlotId;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
const ANONYMOUS: &str = "anonymous";

/// Application state shared across handlers.
pub struct AppState {
    pub control: SharedControlPlane,
    pub config: Arc<Config>,
    pub metrics: Metrics,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/partitions", get(list_partitions).post(set_partitions))
        .route("/v1/partitions/profiles", get(describe_partitions))
        .route("/v1/partitions/capacity/{profile}", get(partition_capacity))
        .route("/v1/partitions/{gpu}/compute", get(list_compute).post(create_compute))
        .route("/v1/partitions/{gpu}/compute/profiles", get(compute_profiles))
        .route("/v1/partitions/{gpu}/compute/import", post(import_compute))
        .route("/v1/partitions/{gpu}/compute/{cp}", delete(delete_compute))
        .route("/v1/partitions/{gpu}/compute/{cp}/export", get(export_compute))
        .route("/v1/subscriptions", get(list_subscriptions).post(subscribe))
        .route("/v1/subscriptions/{id}", delete(unsubscribe))
        .route("/v1/mode", post(set_mode))
        .route("/v1/events", get(events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// A core error on its way to the client.
#[derive(Debug)]
pub struct ApiError(pub PartitionError);

impl From<PartitionError> for ApiError {
    fn from(err: PartitionError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub fn status_for(err: &PartitionError) -> StatusCode {
    match err {
        PartitionError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        PartitionError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        PartitionError::NotFound(_) => StatusCode::NOT_FOUND,
        PartitionError::StateConflict(_) | PartitionError::StillInUse(_) => StatusCode::CONFLICT,
        PartitionError::InsufficientResources(_) => StatusCode::INSUFFICIENT_STORAGE,
        PartitionError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
        PartitionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ─── Caller ────────────────────────────────────────────────────────────────

impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let client_id = parts
            .headers
            .get(CLIENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or(ANONYMOUS)
            .to_string();

        let privileged = match &state.config.server.admin_token {
            None => true,
            Some(token) => parts
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .is_some_and(|presented| presented == token),
        };

        Ok(Caller { client_id, privileged })
    }
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub platform: String,
    pub partitioning_enabled: bool,
    pub gpu_partitions: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetPartitionsRequest {
    pub entries: Vec<PartitionEntry>,
}

/// Swizz ID per batch entry, in request order.
#[derive(Debug, Serialize, Deserialize)]
pub struct SetPartitionsResponse {
    pub swizz_ids: Vec<SlotId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub swizz_id: SlotId,
    #[serde(default)]
    pub compute_id: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModeRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModeResponse {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored: Option<RestoreOutcome>,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let control = state.control.read().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        platform: state.config.platform.name().to_string(),
        partitioning_enabled: control.manager().is_partitioning_enabled(),
        gpu_partitions: control.manager().gpu_partitions().count(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let body = state
        .metrics
        .encode()
        .map_err(|e| PartitionError::Internal(format!("metrics encoding: {e}")))?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn list_partitions(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<GpuPartitionReport>>> {
    let control = state.control.read().await;
    Ok(Json(control.get_partitions(&caller, query.all)?))
}

async fn set_partitions(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<SetPartitionsRequest>,
) -> ApiResult<Json<SetPartitionsResponse>> {
    info!(client = %caller.client_id, entries = req.entries.len(), "SetPartitions request");
    let mut control = state.control.write().await;
    let swizz_ids = control.set_partitions(&caller, &req.entries)?;
    Ok(Json(SetPartitionsResponse { swizz_ids }))
}

async fn describe_partitions(State(state): State<Arc<AppState>>) -> Json<Vec<ProfileReport>> {
    Json(state.control.read().await.describe())
}

async fn partition_capacity(
    State(state): State<Arc<AppState>>,
    Path(profile): Path<String>,
) -> ApiResult<Json<GpuCapacity>> {
    Ok(Json(state.control.read().await.capacity(&profile)?))
}

async fn list_compute(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(gpu): Path<SlotId>,
) -> ApiResult<Json<Vec<ComputePartitionReport>>> {
    Ok(Json(state.control.read().await.compute_partitions(&caller, gpu)?))
}

async fn create_compute(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(gpu): Path<SlotId>,
    Json(req): Json<ComputeRequest>,
) -> ApiResult<(StatusCode, Json<ComputePartitionReport>)> {
    let mut control = state.control.write().await;
    let report = control.create_compute(&caller, gpu, &req)?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn compute_profiles(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(gpu): Path<SlotId>,
) -> ApiResult<Json<Vec<ComputeProfileReport>>> {
    Ok(Json(state.control.read().await.compute_profiles(&caller, gpu)?))
}

async fn import_compute(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(gpu): Path<SlotId>,
    Json(export): Json<ComputeExport>,
) -> ApiResult<(StatusCode, Json<ComputePartitionReport>)> {
    let mut control = state.control.write().await;
    let report = control.import_compute(&caller, gpu, &export)?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn delete_compute(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path((gpu, cp)): Path<(SlotId, u32)>,
) -> ApiResult<StatusCode> {
    state.control.write().await.delete_compute(&caller, gpu, cp)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn export_compute(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path((gpu, cp)): Path<(SlotId, u32)>,
) -> ApiResult<Json<ComputeExport>> {
    Ok(Json(state.control.read().await.export_compute(&caller, gpu, cp)?))
}

async fn list_subscriptions(State(state): State<Arc<AppState>>, caller: Caller) -> Json<Vec<SubscriptionReport>> {
    Json(state.control.read().await.subscriptions(&caller))
}

async fn subscribe(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<SubscribeRequest>,
) -> ApiResult<(StatusCode, Json<SubscriptionReport>)> {
    let mut control = state.control.write().await;
    let report = control.subscribe(&caller, req.swizz_id, req.compute_id)?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.control.write().await.unsubscribe(&caller, id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_mode(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<ModeRequest>,
) -> ApiResult<Json<ModeResponse>> {
    info!(client = %caller.client_id, enabled = req.enabled, "Mode request");
    let mut control = state.control.write().await;
    let restored = control.set_mode(&caller, req.enabled)?;
    Ok(Json(ModeResponse {
        enabled: control.manager().is_partitioning_enabled(),
        restored,
    }))
}

async fn events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rx = state.control.read().await.subscribe_events();
    Sse::new(partition_events_to_sse_stream(rx)).keep_alive(KeepAlive::default())
}
