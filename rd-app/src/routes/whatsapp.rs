use crate::server::AppState;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json};
use rd_channels::parse_webhook_payload;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Default, Deserialize)]
struct VerifyQuery {
    #[serde(default, rename = "hub.mode")]
    mode: Option<String>,
    #[serde(default, rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(default, rename = "hub.challenge")]
    challenge: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route(
        "/webhook/whatsapp",
        get(verify_subscription).post(receive_webhook),
    )
}

#[tracing::instrument(level = "info", skip_all)]
async fn verify_subscription(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let expected = state.whatsapp_verify_token.as_deref();
    let matches = query.mode.as_deref() == Some("subscribe")
        && expected.is_some()
        && query.verify_token.as_deref() == expected;
    if !matches {
        tracing::warn!("whatsapp webhook verification rejected");
        return StatusCode::FORBIDDEN.into_response();
    }
    (StatusCode::OK, query.challenge.unwrap_or_default()).into_response()
}

/// Acknowledges quickly; the gateway task does the actual work. A full queue
/// answers 503 so the platform redelivers later.
#[tracing::instrument(level = "info", skip_all)]
async fn receive_webhook(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let messages = parse_webhook_payload(&payload);
    let received = messages.len();
    for message in messages {
        match state.inbound_tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(message_id = %dropped.message_id, "inbound queue full; asking for redelivery");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            Err(TrySendError::Closed(_)) => {
                tracing::error!("inbound queue closed");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        }
    }
    tracing::debug!(received, "whatsapp webhook accepted");
    (StatusCode::OK, Json(json!({ "received": received }))).into_response()
}
