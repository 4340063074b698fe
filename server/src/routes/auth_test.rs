use super::*;
use crate::state::test_helpers::*;
use axum::http::HeaderValue;
use axum::http::header::COOKIE;

fn parts_with(headers: &[(axum::http::HeaderName, &str)]) -> axum::http::request::Parts {
    let mut builder = axum::http::Request::builder().uri("/api/auth/me");
    for (name, value) in headers {
        builder = builder.header(name, *value);
    }
    builder.body(()).expect("request").into_parts().0
}

async fn extract(headers: &[(axum::http::HeaderName, &str)]) -> Result<AuthUser, StatusCode> {
    use axum::extract::FromRequestParts;
    let state = test_app_state();
    let mut parts = parts_with(headers);
    AuthUser::from_request_parts(&mut parts, &state).await
}

// =============================================================================
// bearer_token
// =============================================================================

#[test]
fn bearer_token_parses_header() {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
    assert_eq!(bearer_token(&headers), Some("abc123"));
}

#[test]
fn bearer_token_ignores_other_schemes_and_blanks() {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
    assert_eq!(bearer_token(&headers), None);
    headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
    assert_eq!(bearer_token(&headers), None);
    assert_eq!(bearer_token(&HeaderMap::new()), None);
}

// =============================================================================
// AuthUser
// =============================================================================

#[tokio::test]
async fn auth_user_from_bearer_header() {
    let auth = extract(&[(AUTHORIZATION, "Bearer tok-alice")]).await.ok().expect("authenticated");
    assert_eq!(auth.user_id, ALICE);
}

#[tokio::test]
async fn auth_user_from_session_cookie() {
    let auth = extract(&[(COOKIE, "theme=dark; session_token=tok-bob")]).await.ok().expect("authenticated");
    assert_eq!(auth.user_id, BOB);
}

#[tokio::test]
async fn auth_user_rejects_missing_and_unknown_tokens() {
    assert_eq!(extract(&[]).await.err(), Some(StatusCode::UNAUTHORIZED));
    assert_eq!(extract(&[(AUTHORIZATION, "Bearer nope")]).await.err(), Some(StatusCode::UNAUTHORIZED));
}

// =============================================================================
// handlers
// =============================================================================

#[tokio::test]
async fn ws_ticket_is_consumable_once() {
    let state = test_app_state();
    let Json(body) = ws_ticket(State(state.clone()), AuthUser { user_id: CAROL }).await.expect("ticket");
    let ticket = body["ticket"].as_str().expect("ticket string").to_string();

    assert_eq!(state.identity.consume_ticket(&ticket).await.unwrap(), Some(CAROL));
    assert_eq!(state.identity.consume_ticket(&ticket).await.unwrap(), None);
}

#[tokio::test]
async fn me_returns_user_id() {
    let Json(body) = me(AuthUser { user_id: ALICE }).await;
    assert_eq!(body["user_id"], serde_json::json!(ALICE));
}
