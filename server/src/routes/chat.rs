//! Chat REST routes: snapshot, history, receipts, badge and uploads.
//!
//! DESIGN
//! ======
//! These handlers go through the same services as the websocket, so a
//! receipt posted over REST still fans out to every live session. Failures
//! render as `{code, message, retryable}` with a status derived from the
//! service error.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use events::{ChatMessage, MessageId, ReadRequest, Snapshot, UserId};
use serde::Deserialize;

use super::auth::AuthUser;
use crate::event::ErrorCode;
use crate::services::attachments::{self, StoredFile, UploadError};
use crate::services::receipts::ReceiptError;
use crate::state::AppState;
use crate::store::{DEFAULT_HISTORY_LIMIT, StoreError};

const MAX_HISTORY_LIMIT: usize = 500;

// =============================================================================
// ERRORS
// =============================================================================

/// Structured REST failure.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    fn from_code(status: StatusCode, err: &impl ErrorCode) -> Self {
        Self { status, code: err.error_code(), message: err.to_string(), retryable: err.retryable() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, code: "E_INVALID_PAYLOAD", message: message.into(), retryable: false }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, message = %self.message, "chat api: request failed");
        }
        let body = serde_json::json!({
            "code": self.code,
            "message": self.message,
            "retryable": self.retryable,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::UnknownUser(_) => StatusCode::NOT_FOUND,
            StoreError::Database(_) | StoreError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::from_code(status, &err)
    }
}

impl From<ReceiptError> for ApiError {
    fn from(err: ReceiptError) -> Self {
        match err {
            ReceiptError::InvalidPayload(_) => Self::from_code(StatusCode::BAD_REQUEST, &err),
            ReceiptError::Store(e) => e.into(),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        let status = match err {
            UploadError::UnsupportedType(_) | UploadError::Empty => StatusCode::BAD_REQUEST,
            UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Storage(_) => StatusCode::BAD_GATEWAY,
            UploadError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::from_code(status, &err)
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `GET /api/chat/conversations`: the caller's conversation list.
pub async fn conversations(State(state): State<AppState>, auth: AuthUser) -> Result<Json<Snapshot>, ApiError> {
    Ok(Json(state.aggregator.snapshot(auth.user_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub after_id: Option<MessageId>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub mark_read: bool,
}

impl HistoryQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT)
    }
}

/// `GET /api/chat/history/{counterpart_id}`: messages ascending by id.
///
/// With `mark_read=true` everything received from the counterpart is marked
/// read first, so the returned page already reflects it.
pub async fn history(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(counterpart): Path<UserId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    if counterpart == auth.user_id {
        return Err(ApiError::bad_request("no conversation with yourself"));
    }
    if query.mark_read {
        state.receipts.mark_all_read(auth.user_id, counterpart).await?;
    }
    let messages = state
        .store
        .history(auth.user_id, counterpart, query.after_id, query.limit())
        .await?;
    Ok(Json(messages))
}

/// `POST /api/chat/read`: mark messages from a counterpart as read.
pub async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<ReadRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let read_count = state
        .receipts
        .mark_read(auth.user_id, req.counterpart_id, req.last_read_id)
        .await?;
    Ok(Json(serde_json::json!({ "read_count": read_count })))
}

/// `GET /api/chat/unread`: badge total.
pub async fn unread(State(state): State<AppState>, auth: AuthUser) -> Result<Json<serde_json::Value>, ApiError> {
    let unread_total = state.store.unread_total(auth.user_id).await?;
    Ok(Json(serde_json::json!({ "unread_total": unread_total })))
}

/// `POST /api/chat/upload`: store one multipart `file` field.
pub async fn upload(
    State(state): State<AppState>,
    auth: AuthUser,
    mut multipart: Multipart,
) -> Result<Json<StoredFile>, ApiError> {
    let Some(storage) = state.storage.as_deref() else {
        return Err(UploadError::NotConfigured.into());
    };

    loop {
        let field = multipart.next_field().await.map_err(|e| ApiError {
            status: e.status(),
            code: "E_INVALID_PAYLOAD",
            message: e.body_text(),
            retryable: false,
        })?;
        let Some(field) = field else {
            return Err(ApiError::bad_request("missing file field"));
        };
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        // Reject by name before reading the body.
        attachments::classify(&filename)?;
        let bytes = field.bytes().await.map_err(|e| ApiError {
            status: e.status(),
            code: "E_INVALID_PAYLOAD",
            message: e.body_text(),
            retryable: false,
        })?;

        let stored = attachments::upload(storage, &filename, bytes.to_vec(), &state.config.limits).await?;
        tracing::info!(user_id = %auth.user_id, file_url = %stored.file_url, "chat api: upload stored");
        return Ok(Json(stored));
    }
}

/// Request body cap for the upload route: the attachment limit plus room
/// for multipart framing.
#[must_use]
pub fn upload_body_limit(max_attachment_bytes: i64) -> usize {
    usize::try_from(max_attachment_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(64 * 1024)
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
