//! Inbound webhook server.
//!
//! Agents spawned through the gateway report back here; the operator's
//! dashboard and CLI hit `/orchestrate`. Every endpoint replies with
//! structured JSON (`{status, message}`) and never leaks an error chain —
//! the callers are agents and scripts, not humans reading stack traces.

use crate::orchestrator::Orchestrator;
use crate::orchestrator::webhooks::{
    FixCompletePayload, OrchestratePayload, ReviewResultPayload, SpecCompletePayload,
    TaskCompletePayload, WebhookReply, WorkerCompletePayload,
};
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

/// Build the webhook router over a shared orchestrator.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/worker-complete", post(worker_complete_handler))
        .route("/task-complete", post(task_complete_handler))
        .route("/review-result", post(review_result_handler))
        .route("/fix-complete", post(fix_complete_handler))
        .route("/spec-complete", post(spec_complete_handler))
        .route("/orchestrate", post(orchestrate_handler))
        .with_state(orchestrator)
}

/// Bind and serve until ctrl-c. The bound address is printed so operators
/// can wire the gateway's webhook base URL.
pub async fn serve(orchestrator: Arc<Orchestrator>) -> Result<()> {
    let addr = orchestrator.config.bind_addr.clone();
    let dev_mode = orchestrator.config.dev_mode;
    let mut app = build_router(orchestrator);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    let local_addr = listener.local_addr()?;
    println!("swarmops orchestrator listening on http://{local_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}

type Reply = (StatusCode, Json<serde_json::Value>);

fn respond(result: Result<WebhookReply>) -> Reply {
    match result {
        Ok(reply) => (StatusCode::OK, Json(serde_json::json!(reply))),
        Err(e) => {
            error!(error = %e, "webhook handler failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "status": "error",
                    "message": e.to_string(),
                })),
            )
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn worker_complete_handler(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(payload): Json<WorkerCompletePayload>,
) -> Reply {
    respond(orchestrator.handle_worker_complete(payload).await)
}

async fn task_complete_handler(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(payload): Json<TaskCompletePayload>,
) -> Reply {
    respond(orchestrator.handle_task_complete(payload).await)
}

async fn review_result_handler(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(payload): Json<ReviewResultPayload>,
) -> Reply {
    respond(orchestrator.handle_review_result(payload).await)
}

async fn fix_complete_handler(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(payload): Json<FixCompletePayload>,
) -> Reply {
    respond(orchestrator.handle_fix_complete(payload).await)
}

async fn spec_complete_handler(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(payload): Json<SpecCompletePayload>,
) -> Reply {
    respond(orchestrator.handle_spec_complete(payload).await)
}

async fn orchestrate_handler(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(payload): Json<OrchestratePayload>,
) -> Reply {
    respond(orchestrator.handle_orchestrate(payload).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwarmConfig;
    use crate::gateway::mock::MockGateway;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_app() -> (Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let config =
            SwarmConfig::for_test(&dir.path().join("data"), &dir.path().join("projects"));
        let orchestrator =
            Orchestrator::new(config, Arc::new(MockGateway::always_ok())).unwrap();
        (build_router(orchestrator), dir)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (app, _dir) = test_app();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn worker_complete_for_unknown_run_is_ignored_not_500() {
        let (app, _dir) = test_app();
        let req = post_json(
            "/worker-complete",
            serde_json::json!({"runId": "ghost", "stepOrder": 100001, "status": "completed"}),
        );
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply["status"], "ignored");
    }

    #[tokio::test]
    async fn review_result_without_cycle_is_ignored() {
        let (app, _dir) = test_app();
        let req = post_json(
            "/review-result",
            serde_json::json!({"status": "approved", "runId": "ghost", "phaseNumber": 1}),
        );
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply["status"], "ignored");
    }

    #[tokio::test]
    async fn orchestrate_continue_without_run_is_ignored() {
        let (app, _dir) = test_app();
        let req = post_json(
            "/orchestrate",
            serde_json::json!({"action": "continue", "project": "demo"}),
        );
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply["status"], "ignored");
    }

    #[tokio::test]
    async fn orchestrate_start_for_missing_project_is_clean_error_json() {
        let (app, _dir) = test_app();
        let req = post_json(
            "/orchestrate",
            serde_json::json!({"action": "start", "project": "missing"}),
        );
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply["status"], "error");
        assert!(reply["message"].is_string());
    }

    #[tokio::test]
    async fn malformed_json_is_rejected_by_extractor() {
        let (app, _dir) = test_app();
        let req = Request::builder()
            .method("POST")
            .uri("/worker-complete")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
