use axum::Json;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use sha2::{Digest, Sha256};

/// Paths reachable without the admin key: health, the synthetic test
/// notification, and the messaging-platform webhook.
pub const PUBLIC_PATHS: &[&str] = &[
    "/api/health",
    "/api/notifications/test",
    "/webhook/whatsapp",
];

#[derive(Debug, Clone, Default)]
pub struct AdminAuthPolicy {
    admin_key_digest: Option<[u8; 32]>,
    pub public_paths: Vec<String>,
}

impl AdminAuthPolicy {
    pub fn new(admin_api_key: Option<&str>) -> Self {
        let admin_key_digest = admin_api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(digest);
        Self {
            admin_key_digest,
            public_paths: PUBLIC_PATHS.iter().map(|p| (*p).to_string()).collect(),
        }
    }

    #[cfg(test)]
    pub fn is_configured(&self) -> bool {
        self.admin_key_digest.is_some()
    }

    /// Compares digests so every comparison touches the same number of bytes.
    fn accepts(&self, provided: &str) -> bool {
        match &self.admin_key_digest {
            Some(expected) => digest(provided) == *expected,
            None => false,
        }
    }

    fn is_public(&self, path: &str) -> bool {
        self.public_paths
            .iter()
            .any(|prefix| path_matches_prefix(path, prefix))
    }
}

#[derive(Debug, Clone)]
pub struct AdminAuthPolicyExt(pub AdminAuthPolicy);

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

pub fn parse_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = raw.trim().splitn(2, char::is_whitespace);
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn path_matches_prefix(path: &str, prefix: &str) -> bool {
    if path == prefix {
        return true;
    }
    let Some(suffix) = path.strip_prefix(prefix) else {
        return false;
    };
    if prefix.ends_with('/') {
        return true;
    }
    suffix.starts_with('/')
}

/// Terse on purpose: callers learn nothing about why they were rejected.
pub fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "success": false, "error": "Unauthorized" })),
    )
        .into_response()
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_admin_auth(req: Request<Body>, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }

    let policy = req
        .extensions()
        .get::<AdminAuthPolicyExt>()
        .map(|v| v.0.clone())
        .unwrap_or_default();
    if policy.is_public(req.uri().path()) {
        return next.run(req).await;
    }

    let Some(provided) = parse_bearer_token(req.headers()) else {
        tracing::warn!(path = %req.uri().path(), reason = "missing_bearer_token", "admin auth rejected");
        return unauthorized();
    };
    if !policy.accepts(&provided) {
        tracing::warn!(path = %req.uri().path(), reason = "invalid_bearer_token", "admin auth rejected");
        return unauthorized();
    }
    next.run(req).await
}
