//! HTTP server and API handlers for the controller.
//!
//! Routes:
//! - `GET /health`: liveness probe with the running version
//! - `POST /api/v1/events`: event ingress (202 / 400 / 503)
//! - `GET /api/v1/agents`: connected agents
//! - `GET /api/v1/alerts`: up to the 100 most recent alerts, oldest first
//! - `GET /metrics`: Prometheus text exposition

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use apss_lib::models::SecurityEvent;

use crate::controller::{should_relay, Controller};
use crate::metrics;

/// Maximum number of alerts returned by the alerts endpoint.
const ALERTS_RESPONSE_LIMIT: usize = 100;

/// Per-request handling deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ServerState {
    pub controller: Arc<Controller>,
    pub registry: Registry,
}

/// Build the controller API router.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/events", post(handle_events))
        .route("/api/v1/agents", get(handle_agents))
        .route("/api/v1/alerts", get(handle_alerts))
        .route("/metrics", get(handle_metrics))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

/// Bind and serve until cancellation, then drain gracefully.
pub async fn serve(
    addr: String,
    state: ServerState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "controller listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn handle_health() -> Response {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn handle_events(State(state): State<ServerState>, body: Bytes) -> Response {
    let event: SecurityEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response(),
    };

    let relay_copy = should_relay(event.severity).then(|| event.clone());

    if state.controller.ingest_event(event).is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Event buffer full").into_response();
    }

    if let Some(event) = relay_copy {
        state.controller.relay_high_severity_event(event);
    }

    StatusCode::ACCEPTED.into_response()
}

async fn handle_agents(State(state): State<ServerState>) -> Response {
    Json(state.controller.get_agents()).into_response()
}

async fn handle_alerts(State(state): State<ServerState>) -> Response {
    Json(state.controller.get_alerts(ALERTS_RESPONSE_LIMIT)).into_response()
}

async fn handle_metrics(State(state): State<ServerState>) -> Response {
    match metrics::encode_text(&state.registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ControllerMetrics;
    use apss_lib::config::ControllerConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_state(event_buffer: usize) -> ServerState {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry).unwrap();
        let cfg = ControllerConfig {
            event_buffer_size: event_buffer,
            alert_buffer_size: 16,
            ..ControllerConfig::default()
        };
        ServerState {
            controller: Arc::new(Controller::new(cfg, metrics)),
            registry,
        }
    }

    fn event_body(agent_id: &str, severity: &str) -> String {
        format!(
            r#"{{
                "id": "{agent_id}-1",
                "agent_id": "{agent_id}",
                "type": "process_start",
                "severity": "{severity}",
                "timestamp": "2024-01-01T00:00:00Z",
                "pod_name": "p",
                "pod_namespace": "ns",
                "process": {{
                    "pid": 1,
                    "ppid": 0,
                    "name": "xmrig",
                    "cmdline": ["xmrig"],
                    "suspicious_indicators": ["possible_cryptominer"]
                }}
            }}"#
        )
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_version() {
        let response = router(test_state(16))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn valid_event_is_accepted_and_tracked() {
        let state = test_state(16);
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/v1/events")
                    .header("content-type", "application/json")
                    .body(Body::from(event_body("a1", "CRITICAL")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .oneshot(Request::get("/api/v1/agents").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let agents = body_json(response).await;
        assert_eq!(agents.as_array().unwrap().len(), 1);
        assert_eq!(agents[0]["id"], "a1");
        assert_eq!(agents[0]["event_count"], 1);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_with_400() {
        let response = router(test_state(16))
            .oneshot(
                Request::post("/api/v1/events")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wrong_method_on_events_is_405() {
        let response = router(test_state(16))
            .oneshot(Request::get("/api/v1/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn full_buffer_returns_503_but_agent_count_advances() {
        let state = test_state(1);
        let app = router(state.clone());

        let first = app
            .clone()
            .oneshot(
                Request::post("/api/v1/events")
                    .body(Body::from(event_body("a1", "INFO")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        // No consumer is running; the queue is full now.
        let second = app
            .clone()
            .oneshot(
                Request::post("/api/v1/events")
                    .body(Body::from(event_body("a1", "INFO")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Agent tracking ran before admission for both requests.
        let agents = state.controller.get_agents();
        assert_eq!(agents[0].event_count, 2);
    }

    #[tokio::test]
    async fn ingested_event_produces_alert_via_pipeline() {
        let state = test_state(16);
        let cancel = CancellationToken::new();
        let mut tasks = state.controller.start(cancel.clone());
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/v1/events")
                    .body(Body::from(event_body("a1", "CRITICAL")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let alerts = loop {
            let response = app
                .clone()
                .oneshot(Request::get("/api/v1/alerts").body(Body::empty()).unwrap())
                .await
                .unwrap();
            let alerts = body_json(response).await;
            if !alerts.as_array().unwrap().is_empty() {
                break alerts;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no alert surfaced before deadline"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(alerts[0]["rule_id"], "APSS-002");
        assert_eq!(alerts[0]["severity"], "CRITICAL");

        cancel.cancel();
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_registered_families() {
        let state = test_state(16);
        state.controller.sweep_stale_agents();

        let response = router(state)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("active_agents"));
    }

    #[tokio::test]
    async fn collector_wire_format_round_trips_through_ingress() {
        // An event serialized the way the collector does must ingress cleanly.
        let mut event =
            SecurityEvent::new(apss_lib::models::EventType::FileModify, Default::default());
        event.agent_id = "a2".to_string();
        event.file = Some(apss_lib::models::FileEventData {
            path: "/etc/passwd".to_string(),
            operation: apss_lib::models::FileOperation::Modify,
            old_hash: Some("a".to_string()),
            new_hash: Some("b".to_string()),
            size_bytes: Some(1),
            permissions: Some("-rw-r--r--".to_string()),
        });
        let body = serde_json::to_string(&event).unwrap();

        let response = router(test_state(16))
            .oneshot(
                Request::post("/api/v1/events")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
