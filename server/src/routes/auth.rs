//! Auth routes: session-token extraction and WS tickets.

use axum::extract::{FromRef, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use events::UserId;

use crate::state::AppState;

pub(crate) const COOKIE_NAME: &str = "session_token";

/// The token from an `Authorization: Bearer` header, if present.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// =============================================================================
// AUTH EXTRACTOR
// =============================================================================

/// Authenticated user resolved from a bearer token or the session cookie.
/// Use as a handler parameter to require authentication.
pub struct AuthUser {
    pub user_id: UserId,
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut axum::http::request::Parts, state: &S) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = bearer_token(&parts.headers)
            .map(str::to_owned)
            .or_else(|| jar.get(COOKIE_NAME).map(Cookie::value).map(str::to_owned))
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let app_state = AppState::from_ref(state);
        let user_id = app_state
            .identity
            .resolve_token(&token)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "session validation failed");
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        Ok(Self { user_id })
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `POST /api/auth/ws-ticket`: create a one-time WS ticket.
pub async fn ws_ticket(State(state): State<AppState>, auth: AuthUser) -> Result<Json<serde_json::Value>, StatusCode> {
    let ticket = state.identity.issue_ticket(auth.user_id).await.map_err(|e| {
        tracing::error!(error = %e, user_id = %auth.user_id, "ws ticket issue failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(serde_json::json!({ "ticket": ticket })))
}

/// `GET /api/auth/me`: the caller's user id.
pub async fn me(auth: AuthUser) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "user_id": auth.user_id }))
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
