pub mod health;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::pipeline::handlers as pipelines;
use crate::sessions::handlers as sessions;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Pipelines
        .route("/api/v1/pipelines", post(pipelines::handle_start_pipeline))
        .route("/api/v1/pipelines/:id", get(pipelines::handle_get_pipeline))
        .route(
            "/api/v1/pipelines/:id/advance",
            post(pipelines::handle_advance_pipeline),
        )
        .route(
            "/api/v1/tasks/:id/status",
            get(pipelines::handle_task_status),
        )
        // Sessions
        .route("/api/v1/sessions", post(sessions::handle_store_session))
        .route(
            "/api/v1/sessions/:id",
            get(sessions::handle_get_session).delete(sessions::handle_delete_session),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::tests::MemoryArtifacts;
    use crate::broker::{BrokerSettings, TaskBroker};
    use crate::config::Config;
    use crate::pipeline::Orchestrator;
    use crate::sessions::SessionStore;
    use crate::store::MemoryStore;
    use crate::tasks::TaskTracker;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let store = Arc::new(MemoryStore::new());
        let tracker = TaskTracker::new(store.clone(), Duration::from_secs(3600));
        let broker = TaskBroker::new(store.clone(), tracker.clone(), BrokerSettings::default());
        build_router(AppState {
            orchestrator: Orchestrator::new(
                store.clone(),
                broker,
                Arc::new(
                    MemoryArtifacts::default().with_object("uploads/blank.txt", b"   ", "text/plain"),
                ),
            ),
            tracker,
            sessions: SessionStore::new(store),
            config: Config::for_tests(),
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let app = app();
        let bundle = json!({"cookies": [{"name": "li_at", "value": "abc"}], "local_storage": {"k": "v"}});

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/sessions",
            Some(json!({"unique_id": "user-1", "state": bundle})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&app, "GET", "/api/v1/sessions/user-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], bundle);

        let (status, _) = send(&app, "DELETE", "/api/v1/sessions/user-1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, "GET", "/api/v1/sessions/user-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (status, _) = send(&app, "DELETE", "/api/v1/sessions/user-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_without_state_is_bad_request() {
        let (status, body) = send(
            &app(),
            "POST",
            "/api/v1/sessions",
            Some(json!({"unique_id": "user-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_session_with_huge_ttl_is_bad_request() {
        let (status, body) = send(
            &app(),
            "POST",
            "/api/v1/sessions",
            Some(json!({"unique_id": "user-1", "state": {}, "ttl_seconds": u64::MAX})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_start_pipeline_and_poll_head_task() {
        let app = app();
        let (status, started) = send(
            &app,
            "POST",
            "/api/v1/pipelines",
            Some(json!({
                "resume": {"type": "text", "text": "Jane Doe\nRust"},
                "job_source": "Rust engineer, remote"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let task_uri = format!("/api/v1/tasks/{}/status", started["task_id"].as_str().unwrap());
        let (status, envelope) = send(&app, "GET", &task_uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope["status"], "PENDING");
        assert_eq!(envelope["kind"], "extract");

        let pipeline_uri = format!("/api/v1/pipelines/{}", started["pipeline_id"].as_str().unwrap());
        let (status, view) = send(&app, "GET", &pipeline_uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["phase"], "RUNNING");

        let (status, body) = send(&app, "POST", &format!("{pipeline_uri}/advance"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn test_empty_resume_is_rejected_with_its_kind() {
        let (status, body) = send(
            &app(),
            "POST",
            "/api/v1/pipelines",
            Some(json!({
                "resume": {"type": "text", "text": "   "},
                "job_source": "Rust engineer"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "EMPTY_RESUME");
    }

    #[tokio::test]
    async fn test_blank_uploaded_resume_is_rejected_before_queueing() {
        let (status, body) = send(
            &app(),
            "POST",
            "/api/v1/pipelines",
            Some(json!({
                "resume": {"type": "object", "key": "uploads/blank.txt"},
                "job_source": "Rust engineer"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "EMPTY_RESUME");
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let app = app();
        let (status, _) = send(&app, "GET", "/api/v1/tasks/not-a-uuid/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let uri = format!("/api/v1/pipelines/{}", uuid::Uuid::new_v4());
        let (status, _) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
