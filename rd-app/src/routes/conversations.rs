use super::error::{ApiError, required};
use crate::conversation::{HandoffStatus, Metadata, Role};
use crate::server::AppState;
use axum::extract::Query;
use axum::routing::{get, post, put};
use axum::{Extension, Json};
use rd_channels::OutboundMessage;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserQuery {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusRequest {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentMessageRequest {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/conversations", get(list_conversations))
        .route(
            "/api/conversation",
            get(get_conversation).delete(clear_conversation),
        )
        .route("/api/conversation/status", put(update_status))
        .route("/api/conversation/message", post(send_agent_message))
}

fn handoff_json(user_id: &str, metadata: &Metadata) -> Value {
    json!({
        "success": true,
        "userId": user_id,
        "status": metadata.status(),
        "handledBy": metadata.handled_by(),
    })
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_conversations(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let conversations = state.store.list_conversations(query.limit).await?;
    Ok(Json(json!({
        "totalCount": conversations.len(),
        "conversations": conversations,
    })))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_conversation(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, ApiError> {
    let user_id = required(query.user_id.as_deref(), "userId")?;
    let conversation = state
        .store
        .get_conversation(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Conversation not found: {user_id}")))?;
    Ok(Json(json!(conversation)))
}

#[tracing::instrument(level = "info", skip_all)]
async fn clear_conversation(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, ApiError> {
    let user_id = required(query.user_id.as_deref(), "userId")?;
    let metadata = state.store.clear_history(user_id).await?;
    Ok(Json(handoff_json(user_id, &metadata)))
}

#[tracing::instrument(level = "info", skip_all)]
async fn update_status(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<UserQuery>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = required(query.user_id.as_deref(), "userId")?;
    let agent_id = required(req.agent_id.as_deref(), "agentId")?;
    let status: HandoffStatus = required(req.status.as_deref(), "status")?.parse()?;
    let metadata = state
        .store
        .set_status(user_id, Some(agent_id), status)
        .await?;
    Ok(Json(handoff_json(user_id, &metadata)))
}

/// Agent reply: recorded first, then taken over, then delivered. A failed
/// delivery is reported but leaves the recorded message in place.
#[tracing::instrument(level = "info", skip_all)]
async fn send_agent_message(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<UserQuery>,
    Json(req): Json<AgentMessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = required(query.user_id.as_deref(), "userId")?;
    let agent_id = required(req.agent_id.as_deref(), "agentId")?;
    let message = required(req.message.as_deref(), "message")?;

    if state.store.get_conversation(user_id).await?.is_none() {
        return Err(ApiError::NotFound(format!(
            "Conversation not found: {user_id}"
        )));
    }
    state
        .store
        .append_message(user_id, Role::Assistant, message, Some(agent_id))
        .await?;
    let metadata = state
        .store
        .set_status(user_id, Some(agent_id), HandoffStatus::HumanHandled)
        .await?;

    let delivery = state
        .channel
        .send(user_id, OutboundMessage::text(message))
        .await;
    let mut body = handoff_json(user_id, &metadata);
    body["delivered"] = json!(delivery.is_ok());
    if let Err(error) = delivery {
        tracing::warn!(user_id, channel = state.channel.channel_id(), error = %error, "agent message delivery failed");
        body["deliveryError"] = json!(error.to_string());
    }
    Ok(Json(body))
}
