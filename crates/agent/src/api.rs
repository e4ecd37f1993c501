//! Health and metrics endpoints of the agent

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use tier_lib::health::{ComponentStatus, HealthRegistry};
use tracing::{error, info};

async fn healthz(State(health): State<HealthRegistry>) -> impl IntoResponse {
    let report = health.health().await;
    let status_code = match report.status {
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
    };
    (status_code, Json(report))
}

async fn readyz(State(health): State<HealthRegistry>) -> impl IntoResponse {
    let readiness = health.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics() -> axum::response::Response {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
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

pub fn create_router(health: HealthRegistry) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(health)
}

pub async fn serve(port: u16, health: HealthRegistry) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting health server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, create_router(health)).await?;
    Ok(())
}
