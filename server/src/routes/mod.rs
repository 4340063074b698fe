//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the REST endpoints and the live websocket channel under
//! a single Axum router. Everything lives under `/api` except `/healthz`.

pub mod auth;
pub mod chat;
pub mod ws;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let upload_limit = chat::upload_body_limit(state.config.limits.max_attachment_bytes);

    Router::new()
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/ws-ticket", post(auth::ws_ticket))
        .route("/api/chat/conversations", get(chat::conversations))
        .route("/api/chat/history/{counterpart_id}", get(chat::history))
        .route("/api/chat/read", post(chat::mark_read))
        .route("/api/chat/unread", get(chat::unread))
        .route(
            "/api/chat/upload",
            post(chat::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/chat/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
