use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::AppState;

/// Bearer-token guard for every `/api` route.
pub async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if token_matches(&state, token) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "Rejected dashboard request without valid token");
        unauthorized()
    }
}

/// An empty configured token never matches.
pub fn token_matches(state: &AppState, candidate: Option<&str>) -> bool {
    match candidate {
        Some(t) => !state.dashboard_token.is_empty() && t == state.dashboard_token,
        None => false,
    }
}

pub fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}
