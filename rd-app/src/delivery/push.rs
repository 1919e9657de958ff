use super::{NotificationPresenter, Origin};
use crate::conversation::now_millis;
use crate::http_auth::{parse_bearer_token, unauthorized};
use crate::mailbox::{Notification, NotificationKind};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

/// Presents pushed payloads immediately. It never acknowledges: the next
/// poll or worker cycle reconciles the mailbox.
pub struct PushConsumer {
    presenter: Arc<NotificationPresenter>,
    auth_token: Option<String>,
}

impl PushConsumer {
    pub fn new(presenter: Arc<NotificationPresenter>) -> Self {
        Self {
            presenter,
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        self
    }

    /// Accepts a bare notification or a staff alert wrapping one in
    /// `payload`. Anything else becomes a synthetic `system` notification.
    pub async fn receive(&self, payload: &serde_json::Value) -> bool {
        let notification = notification_from_push(payload);
        tracing::info!(notification_id = %notification.id, "push received");
        self.presenter.present(&notification, Origin::Push).await
    }
}

fn notification_from_push(payload: &serde_json::Value) -> Notification {
    if let Some(inner) = payload.get("payload") {
        if let Ok(notification) = serde_json::from_value::<Notification>(inner.clone()) {
            return notification;
        }
    }
    if let Ok(notification) = serde_json::from_value::<Notification>(payload.clone()) {
        return notification;
    }
    let text_field = |name: &str| {
        payload
            .get(name)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    let subject = text_field("subject");
    Notification {
        id: format!("push-{}", ulid::Ulid::new()),
        kind: NotificationKind::System,
        title: if subject.is_empty() {
            "Notification".to_string()
        } else {
            subject
        },
        body: text_field("text"),
        user_id: None,
        timestamp: now_millis(),
        urgent: payload
            .get("urgent")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        delivered_at: None,
        extra: serde_json::Value::Null,
    }
}

pub fn push_router(consumer: Arc<PushConsumer>) -> Router {
    Router::new()
        .route("/push", post(receive_push))
        .with_state(consumer)
}

async fn receive_push(
    State(consumer): State<Arc<PushConsumer>>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    if let Some(expected) = &consumer.auth_token {
        if parse_bearer_token(&headers).as_deref() != Some(expected.as_str()) {
            return unauthorized();
        }
    }
    let presented = consumer.receive(&payload).await;
    (StatusCode::ACCEPTED, Json(json!({ "presented": presented }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::NotificationSink;
    use crate::delivery::test_support::RecordingSink;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
    use tower::util::ServiceExt;

    fn consumer(token: Option<&str>) -> (Arc<PushConsumer>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let presenter = Arc::new(NotificationPresenter::new(vec![
            sink.clone() as Arc<dyn NotificationSink>
        ]));
        let consumer =
            Arc::new(PushConsumer::new(presenter).with_auth_token(token.map(ToOwned::to_owned)));
        (consumer, sink)
    }

    fn push_request(body: serde_json::Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/push")
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[test]
    fn staff_alert_payload_unwraps_the_notification() {
        let alert = json!({
            "subject": "Aide",
            "text": "u1 a besoin d'aide",
            "urgent": true,
            "payload": {
                "id": "01J0000000000000000000000",
                "type": "help_needed",
                "title": "Aide",
                "body": "help me",
                "userId": "u1",
                "timestamp": 1,
                "urgent": true
            }
        });
        let n = notification_from_push(&alert);
        assert_eq!(n.id, "01J0000000000000000000000");
        assert_eq!(n.kind, NotificationKind::HelpNeeded);
        assert_eq!(n.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn free_form_payload_becomes_system_notification() {
        let n = notification_from_push(&json!({ "subject": "Ping", "text": "hello" }));
        assert_eq!(n.kind, NotificationKind::System);
        assert_eq!(n.title, "Ping");
        assert!(n.id.starts_with("push-"));
    }

    #[tokio::test]
    async fn push_route_presents_without_acknowledging() {
        let (consumer, sink) = consumer(Some("push-secret"));
        let router = push_router(consumer);
        let body = json!({
            "id": "n-1",
            "type": "order_confirmed",
            "title": "Commande",
            "body": "2 pizzas",
            "timestamp": 1
        });

        let response = router
            .clone()
            .oneshot(push_request(body.clone(), Some("push-secret")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(parsed["presented"], true);
        assert_eq!(sink.ids(), vec!["n-1"]);

        let response = router
            .oneshot(push_request(body, Some("wrong")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
