//! HTTP API for health checks, Prometheus metrics and instance queries

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tier_lib::{
    health::{ComponentStatus, HealthRegistry},
    store::{Repository, StoreError},
    InstanceStatus, ResourceHistorySample, ThresholdConfig,
};
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub repo: Repository,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, repo: Repository) -> Self {
        Self {
            health_registry,
            repo,
        }
    }
}

/// Error body of every non-2xx query response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

enum ApiError {
    NotFound(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(name) => (StatusCode::NOT_FOUND, format!("Instance {} not found", name)),
            ApiError::Store(e) => {
                error!(error = %e, "Store query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_instances(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<InstanceStatus>>, ApiError> {
    Ok(Json(state.repo.latest_per_key::<InstanceStatus>()?))
}

async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<InstanceStatus>, ApiError> {
    state
        .repo
        .most_recent::<InstanceStatus>(&name)?
        .map(Json)
        .ok_or(ApiError::NotFound(name))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_minutes")]
    minutes: u32,
}

fn default_history_minutes() -> u32 {
    60
}

/// Samples of the trailing window, newest first
async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ResourceHistorySample>>, ApiError> {
    let samples = state
        .repo
        .within_window::<ResourceHistorySample>(&name, query.minutes)?;
    if samples.is_empty() && state.repo.most_recent::<InstanceStatus>(&name)?.is_none() {
        return Err(ApiError::NotFound(name));
    }
    Ok(Json(samples))
}

async fn get_thresholds(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ThresholdConfig>, ApiError> {
    state
        .repo
        .most_recent::<ThresholdConfig>(&name)?
        .map(Json)
        .ok_or(ApiError::NotFound(name))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/instances", get(list_instances))
        .route("/api/v1/instances/:name", get(get_instance))
        .route("/api/v1/instances/:name/history", get(get_history))
        .route("/api/v1/instances/:name/thresholds", get(get_thresholds))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
