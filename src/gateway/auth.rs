//! Bearer-token authentication middleware. Every route is guarded; when
//! `Settings::auth_token` is unset the check is a no-op, matching the
//! original's behavior of treating a missing token as "auth disabled"
//! rather than "reject everything."

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::gateway::config::Settings;
use crate::gateway::error::GatewayError;

pub async fn require_authorization(
    State(settings): State<Arc<Settings>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(expected) = settings.auth_token.as_deref() else {
        return next.run(request).await;
    };

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => next.run(request).await,
        _ => unauthorized(),
    }
}

fn unauthorized() -> Response {
    let error = GatewayError::Unauthorized;
    (StatusCode::UNAUTHORIZED, Json(error.detail())).into_response()
}
