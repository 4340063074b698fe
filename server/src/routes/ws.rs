//! WebSocket handler: the live channel.
//!
//! DESIGN
//! ======
//! The handshake resolves identity before upgrading; anything unauthenticated
//! gets a 401 and never reaches the registry. After upgrade the connection
//! registers its bounded queue and enters a `select!` loop:
//! - Incoming client events → decode + dispatch to the router or receipts
//! - Queued events from the registry → forward to the client
//! - Heartbeat tick → close when idle, otherwise send a Ping
//!
//! Senders get no direct ack for messages: the router broadcasts the
//! persisted message to every session of both participants, including the
//! one that sent it. Only failures are replied to directly.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → register → send `connected` then `snapshot`
//! 2. Client sends events → dispatch → errors/pongs back to the sender
//! 3. Registry evicts (queue full, sweeper) → queue closes → loop exits
//! 4. Close / idle → deregister

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use events::{Connected, InboundEvent, OutboundEvent, UserId};
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::auth::bearer_token;
use crate::event::{ErrorCode, MalformedEvent, error_event};
use crate::services::registry::SessionHandle;
use crate::services::session::AuthError;
use crate::state::AppState;

/// Binary frames carry nothing in this protocol.
#[derive(Debug, thiserror::Error)]
#[error("binary frames are not supported")]
pub struct BinaryFrame;

impl ErrorCode for BinaryFrame {
    fn error_code(&self) -> &'static str {
        "E_INVALID_PAYLOAD"
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match authenticate(&state, &params, &headers).await {
        Ok(uid) => uid,
        Err(AuthError::Unauthenticated) => {
            return (StatusCode::UNAUTHORIZED, "valid ticket or token required").into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "ws handshake identity lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "identity lookup error").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, user_id))
}

/// Resolve the connecting user from `?ticket=`, `?token=` or a bearer header,
/// in that order.
pub(crate) async fn authenticate(
    state: &AppState,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<UserId, AuthError> {
    let resolved = if let Some(ticket) = params.get("ticket") {
        state.identity.consume_ticket(ticket).await?
    } else if let Some(token) = params.get("token").map(String::as_str).or_else(|| bearer_token(headers)) {
        state.identity.resolve_token(token).await?
    } else {
        None
    };
    resolved.ok_or(AuthError::Unauthenticated)
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user_id: UserId) {
    let channel = state.config.channel;
    let (client_tx, mut client_rx) = mpsc::channel::<OutboundEvent>(channel.send_queue_capacity);

    // Register before the snapshot so nothing sent in between is missed.
    let handle = state.registry.register(user_id, client_tx).await;
    let connection_id = handle.connection_id;

    if greet(&mut socket, &state, handle).await.is_err() {
        state.registry.deregister(handle).await;
        return;
    }
    info!(%connection_id, %user_id, "ws: client connected");

    let mut last_inbound = Instant::now();
    let mut ping = tokio::time::interval_at(Instant::now() + channel.heartbeat_interval, channel.heartbeat_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                last_inbound = Instant::now();
                if !state.registry.heartbeat(handle).await {
                    info!(%connection_id, "ws: connection was evicted");
                    break;
                }
                let replies = match msg {
                    Message::Text(text) => process_inbound_text(&state, handle, text.as_str()).await,
                    Message::Binary(_) => vec![error_event(&BinaryFrame, None)],
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => Vec::new(),
                };
                if send_replies(&mut socket, &replies).await.is_err() {
                    break;
                }
            }
            event = client_rx.recv() => {
                let Some(event) = event else {
                    info!(%connection_id, "ws: outbound queue closed");
                    break;
                };
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if last_inbound.elapsed() > channel.idle_timeout {
                    info!(%connection_id, idle_secs = last_inbound.elapsed().as_secs(), "ws: heartbeat timed out");
                    break;
                }
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.registry.deregister(handle).await;
    info!(%connection_id, %user_id, "ws: client disconnected");
}

/// Send `connected` and the initial `snapshot` straight to the socket.
async fn greet(socket: &mut WebSocket, state: &AppState, handle: SessionHandle) -> Result<(), ()> {
    let connected = OutboundEvent::Connected(Connected {
        connection_id: handle.connection_id,
        user_id: handle.user_id,
    });
    send_event(socket, &connected).await?;

    let snapshot = match state.aggregator.snapshot(handle.user_id).await {
        Ok(snapshot) => OutboundEvent::Snapshot(snapshot),
        Err(e) => {
            warn!(user_id = %handle.user_id, error = %e, "ws: snapshot failed");
            error_event(&e, None)
        }
    };
    send_event(socket, &snapshot).await
}

// =============================================================================
// EVENT DISPATCH
// =============================================================================

/// Decode and process one inbound text frame and return events for the
/// sender only. Deliveries to other sessions go through the registry.
pub(crate) async fn process_inbound_text(state: &AppState, handle: SessionHandle, text: &str) -> Vec<OutboundEvent> {
    let user_id = handle.user_id;
    let event = match events::decode_inbound(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(connection_id = %handle.connection_id, error = %e, "ws: invalid inbound event");
            return vec![error_event(&MalformedEvent(e), None)];
        }
    };

    match event {
        InboundEvent::Message(req) => {
            let client_ref = req.client_ref.clone();
            match state.router.submit(user_id, req).await {
                Ok(_) => Vec::new(),
                Err(e) => vec![error_event(&e, client_ref)],
            }
        }
        InboundEvent::MarkRead(req) => match state
            .receipts
            .mark_read(user_id, req.counterpart_id, req.last_read_id)
            .await
        {
            Ok(_) => Vec::new(),
            Err(e) => vec![error_event(&e, None)],
        },
        InboundEvent::Ping => vec![OutboundEvent::Pong],
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Send direct replies in order, stopping at the first failed write.
async fn send_replies<S>(sink: &mut S, replies: &[OutboundEvent]) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    for event in replies {
        send_event(sink, event).await?;
    }
    Ok(())
}

async fn send_event<S>(sink: &mut S, event: &OutboundEvent) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = match events::encode_event(event) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, kind = event.kind(), "ws: failed to serialize event");
            return Err(());
        }
    };
    if let OutboundEvent::Error(err) = event {
        warn!(code = %err.code, message = %err.message, "ws: send event type=error");
    } else {
        debug!(kind = event.kind(), "ws: send event");
    }
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
