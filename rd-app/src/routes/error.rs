use crate::conversation::StoreError;
use crate::kv::KvError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Error shape shared by every dashboard route: `{"success":false,"error":...}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Unauthorized,
    Validation(String),
    Upstream(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::NotFound(m) | Self::Validation(m) | Self::Upstream(m) => m,
            Self::Unauthorized => return crate::http_auth::unauthorized(),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed upstream");
        }
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(user_id) => Self::NotFound(format!("Conversation not found: {user_id}")),
            StoreError::Validation(message) => Self::Validation(message),
            StoreError::Storage(e) => Self::Upstream(e.to_string()),
        }
    }
}

impl From<KvError> for ApiError {
    fn from(e: KvError) -> Self {
        Self::Upstream(e.to_string())
    }
}

/// Reads a required, non-blank request field.
pub fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, ApiError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::validation(format!("{field} is required")))
}
