//! Integration tests for the manager API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tier_lib::{
    actions::{CommandActions, CommandTemplates},
    health::{components, HealthRegistry},
    lifecycle::StaticTierCatalog,
    transport::Endpoint,
    AgentStatus, Envelope, InstanceStatus, Payload, Repository, ResourceHistorySample,
    ScalerMetrics, ShutdownSignal, StructuredLogger, ThresholdConfig, ThresholdSettings,
};
use tier_manager::api::{create_router, AppState};
use tier_manager::app::Manager;
use tier_manager::config::ManagerConfig;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::LISTENER).await;
    health_registry.register(components::OUTBOX).await;

    let state = Arc::new(AppState::new(health_registry, Repository::in_memory()));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
}

fn seed_host(repo: &Repository, hostname: &str) {
    let mut status = InstanceStatus::new(hostname, AgentStatus::Up, true);
    status.current_tier = Some("n2-standard-4".to_string());
    repo.append(&status).unwrap();
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["listener"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::OUTBOX, "12 entries pending")
        .await;

    let (status, health) = get(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::LISTENER, "Shutting down")
        .await;

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_ready_flag() {
    let (app, state) = setup_test_app().await;

    let (status, readiness) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    state.health_registry.set_ready(true).await;
    let (status, readiness) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::LISTENER, "Failed")
        .await;

    let (status, readiness) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(readiness["reason"].as_str().unwrap().contains("listener"));
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app().await;

    ScalerMetrics::new().observe_dispatch_latency(0.002);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("tierwatch_dispatch_latency_seconds_bucket"));
    assert!(metrics_text.contains("tierwatch_outbox_pending"));
}

#[tokio::test]
async fn test_list_and_get_instances() {
    let (app, state) = setup_test_app().await;
    seed_host(&state.repo, "web-02");
    seed_host(&state.repo, "web-01");
    state
        .repo
        .append(&InstanceStatus::new("web-01", AgentStatus::Down, true))
        .unwrap();

    let (status, instances) = get(app.clone(), "/api/v1/instances").await;
    assert_eq!(status, StatusCode::OK);
    let instances = instances.as_array().unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0]["hostname"], "web-01");
    assert_eq!(instances[0]["agent_status"], "DOWN");

    let (status, instance) = get(app, "/api/v1/instances/web-02").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(instance["current_tier"], "n2-standard-4");
}

#[tokio::test]
async fn test_unknown_instance_returns_404() {
    let (app, _state) = setup_test_app().await;

    for uri in [
        "/api/v1/instances/ghost",
        "/api/v1/instances/ghost/history",
        "/api/v1/instances/ghost/thresholds",
    ] {
        let (status, body) = get(app.clone(), uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        assert_eq!(body["error"], "Instance ghost not found");
    }
}

#[tokio::test]
async fn test_history_window() {
    let (app, state) = setup_test_app().await;
    seed_host(&state.repo, "web-01");
    for (minutes_ago, cpu) in [(90, 10.0), (30, 50.0), (5, 85.0)] {
        state
            .repo
            .append(&ResourceHistorySample {
                hostname: "web-01".to_string(),
                timestamp: Utc::now() - chrono::Duration::minutes(minutes_ago),
                cpu_usage: Some(cpu),
                memory_usage: None,
                change_request: None,
            })
            .unwrap();
    }

    let (status, history) = get(app.clone(), "/api/v1/instances/web-01/history").await;
    assert_eq!(status, StatusCode::OK);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["cpu_usage"], 85.0);

    let (_, history) = get(app, "/api/v1/instances/web-01/history?minutes=120").await;
    assert_eq!(history.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_get_thresholds() {
    let (app, state) = setup_test_app().await;
    state
        .repo
        .append(&ThresholdConfig {
            hostname: "web-01".to_string(),
            settings: ThresholdSettings::default(),
            updated_at: Utc::now(),
        })
        .unwrap();

    let (status, config) = get(app, "/api/v1/instances/web-01/thresholds").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["settings"]["continuity"], 3);
    assert_eq!(config["settings"]["upper"]["cpu"], 80.0);
}

#[tokio::test]
async fn test_halted_outbox_sweep_degrades_healthz() {
    let data_dir = tempfile::TempDir::new().unwrap();
    let config: ManagerConfig =
        serde_json::from_value(serde_json::json!({ "data_dir": data_dir.path() })).unwrap();
    let repo = Repository::in_memory();
    let manager = Manager::assemble(
        &config,
        repo.clone(),
        Arc::new(StaticTierCatalog::new()),
        Arc::new(CommandActions::new(
            CommandTemplates::default(),
            Duration::from_secs(1),
        )),
        ShutdownSignal::never(),
        StructuredLogger::new("test"),
    )
    .await
    .unwrap();

    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent = Endpoint::new("127.0.0.1", closed.local_addr().unwrap().port());
    drop(closed);
    manager
        .outbox
        .persist(&agent, &Envelope::new("web-01", "1.0.0", Payload::Up))
        .unwrap();
    assert!(manager.outbox.sweep().await.unwrap().halted);

    let app = create_router(Arc::new(AppState::new(manager.health.clone(), repo)));
    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["components"]["outbox"]["status"], "degraded");
}
