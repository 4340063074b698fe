//! Shared chat event model and JSON codec for the live channel.
//!
//! This crate owns the wire representation used by both `server` and `cli`.
//! Every event is a JSON object tagged by `type`; inbound events flow from a
//! client to the server, outbound events fan out from the server to every
//! live connection of the affected users.

pub mod reconcile;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque user identity issued by the external auth collaborator.
pub type UserId = Uuid;

/// Canonical message id. Strictly increasing within a conversation.
pub type MessageId = i64;

/// Error returned by the codec helpers.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text is not valid JSON or does not match any known event shape.
    #[error("malformed event: {0}")]
    Json(#[from] serde_json::Error),
}

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// MESSAGE MODEL
// =============================================================================

/// What a message carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Link,
    Image,
    File,
}

impl MessageKind {
    /// Stable lowercase name, matching the wire and the `messages.message_type` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Link => "link",
            Self::Image => "image",
            Self::File => "file",
        }
    }

    /// Parse the lowercase name back into a kind.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "link" => Some(Self::Link),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    /// Image and file messages reference an uploaded attachment.
    #[must_use]
    pub fn is_attachment(self) -> bool {
        matches!(self, Self::Image | Self::File)
    }
}

/// A persisted, server-confirmed message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// Text, link, or attachment caption.
    #[serde(default)]
    pub content: String,
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Server clock, milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub is_read: bool,
}

impl ChatMessage {
    /// True if this message belongs to the conversation between `a` and `b`.
    #[must_use]
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b) || (self.sender_id == b && self.receiver_id == a)
    }

    /// The other participant from `user`'s point of view.
    #[must_use]
    pub fn counterpart_of(&self, user: UserId) -> Option<UserId> {
        if self.sender_id == user {
            Some(self.receiver_id)
        } else if self.receiver_id == user {
            Some(self.sender_id)
        } else {
            None
        }
    }
}

/// Denormalized per-user view of one counterpart relationship.
///
/// `user_id` is the counterpart. `unread_count` counts messages from the
/// counterpart that the owner has not read yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub user_id: UserId,
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    pub last_message_id: MessageId,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub file_url: Option<String>,
    pub message_type: MessageKind,
    /// Last activity, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Whether the owner sent the last message.
    pub is_sender: bool,
    pub unread_count: u64,
}

// =============================================================================
// INBOUND
// =============================================================================

/// A send request as transmitted by a client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Opaque client token, echoed back only on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

/// Acknowledge everything from `counterpart_id` up to `last_read_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub counterpart_id: UserId,
    pub last_read_id: MessageId,
}

/// Client → server events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Message(SendRequest),
    MarkRead(ReadRequest),
    Ping,
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Sent once to a freshly registered connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    pub connection_id: Uuid,
    pub user_id: UserId,
}

/// Initial conversation list plus the badge total.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub conversations: Vec<ConversationSummary>,
    pub unread_total: u64,
}

/// Tells a sender that `reader_id` has read their messages.
///
/// `chat_id` duplicates `reader_id` for clients that still key on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub reader_id: UserId,
    pub counterpart_id: UserId,
    pub chat_id: UserId,
    pub last_read_id: MessageId,
    pub read_count: u64,
}

impl ReadReceipt {
    #[must_use]
    pub fn new(reader_id: UserId, counterpart_id: UserId, last_read_id: MessageId, read_count: u64) -> Self {
        Self { reader_id, counterpart_id, chat_id: reader_id, last_read_id, read_count }
    }
}

/// A recomputed summary for one of the recipient's conversations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationUpdate {
    /// Counterpart of the updated conversation.
    pub user_id: UserId,
    pub conversation: ConversationSummary,
    /// Change in unread count since the previous summary, for badge animation.
    pub unread_delta: i64,
}

/// Structured failure for one inbound event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

/// Server → client events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Connected(Connected),
    Snapshot(Snapshot),
    Message(ChatMessage),
    ReadReceipt(ReadReceipt),
    ConversationUpdate(ConversationUpdate),
    Error(ErrorEvent),
    Pong,
}

impl OutboundEvent {
    /// The `type` tag, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Snapshot(_) => "snapshot",
            Self::Message(_) => "message",
            Self::ReadReceipt(_) => "read_receipt",
            Self::ConversationUpdate(_) => "conversation_update",
            Self::Error(_) => "error",
            Self::Pong => "pong",
        }
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode an outbound event as JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails.
pub fn encode_event(event: &OutboundEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an outbound event received by a client.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for malformed or unknown events.
pub fn decode_event(text: &str) -> Result<OutboundEvent, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode an inbound event for transmission by a client.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails.
pub fn encode_inbound(event: &InboundEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an inbound event received by the server.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for malformed or unknown events.
pub fn decode_inbound(text: &str) -> Result<InboundEvent, CodecError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
