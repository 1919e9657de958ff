use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let store = state.kv.ping().await;
    if let Err(error) = &store {
        tracing::warn!(%error, "health check: store unreachable");
    }
    let ready = store.is_ok();

    Json(serde_json::json!({
        "status": if ready { "ok" } else { "degraded" },
        "ready": ready,
        "checked_at": Utc::now(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "checks": {
            "store": {
                "reachable": ready,
                "error": store.err().map(|e| e.to_string()),
            },
            "channel": state.channel.channel_id(),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{TestApp, body_json};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn health_is_public_and_reports_store() {
        let app = TestApp::new();
        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["checks"]["store"]["reachable"], true);
    }
}
