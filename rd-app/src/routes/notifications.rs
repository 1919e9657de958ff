use super::error::ApiError;
use crate::mailbox::{NewNotification, NotificationKind};
use crate::server::AppState;
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
struct MarkReceivedRequest {
    #[serde(default)]
    ids: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct TestNotificationRequest {
    #[serde(default, rename = "type")]
    kind: Option<NotificationKind>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/notifications/pending", get(list_pending))
        .route("/api/notifications/delivered", get(list_delivered))
        .route("/api/notifications/mark-received", post(mark_received))
        .route("/api/notifications/test", post(create_test))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_pending(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let notifications = state.mailbox.list_pending().await?;
    Ok(Json(json!({
        "count": notifications.len(),
        "notifications": notifications,
    })))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_delivered(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let notifications = state.mailbox.list_delivered().await?;
    Ok(Json(json!({
        "count": notifications.len(),
        "notifications": notifications,
    })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn mark_received(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<MarkReceivedRequest>,
) -> Result<Json<Value>, ApiError> {
    let ids = req
        .ids
        .ok_or_else(|| ApiError::validation("ids is required"))?;
    let marked = state.mailbox.acknowledge(ids.as_slice()).await;
    Ok(Json(json!({ "success": true, "marked": marked })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn create_test(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<TestNotificationRequest>,
) -> Result<Json<Value>, ApiError> {
    let kind = req.kind.unwrap_or(NotificationKind::Test);
    let title = req
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "Notification de test".to_string());
    let body = req
        .body
        .unwrap_or_else(|| "Ceci est une notification de test.".to_string());
    let notification = state
        .mailbox
        .create(NewNotification::new(kind, title, body))
        .await?;
    Ok(Json(json!({ "success": true, "notification": notification })))
}
