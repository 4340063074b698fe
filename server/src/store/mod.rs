//! Message Store Accessor: the persistence contract for chat.
//!
//! DESIGN
//! ======
//! The store is the only durable shared resource. It assigns canonical
//! message ids and server timestamps atomically with the insert, so ids are
//! strictly increasing and never reused. Unread counts are always answered
//! by counting unread rows; nothing here keeps a running counter.
//!
//! Two implementations sit behind `Arc<dyn MessageStore>`: Postgres for
//! production and an in-memory store for development and tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use events::{ChatMessage, ConversationSummary, MessageId, MessageKind, UserId};
use serde::Serialize;

use crate::event::ErrorCode;

pub use memory::MemoryMessageStore;
pub use postgres::PgMessageStore;

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

// =============================================================================
// TYPES
// =============================================================================

/// Profile fields this subsystem reads from the external profile service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub avatar_url: Option<String>,
}

/// A validated message ready to persist. Id and timestamp come from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub file_url: Option<String>,
    pub file_size: Option<i64>,
    pub file_type: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown user: {0}")]
    UnknownUser(UserId),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownUser(_) => "E_UNKNOWN_USER",
            Self::Database(_) => "E_DATABASE",
            Self::Corrupt(_) => "E_CORRUPT_ROW",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

// =============================================================================
// CONTRACT
// =============================================================================

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning its canonical id and server timestamp.
    async fn insert_message(&self, new: NewMessage) -> Result<ChatMessage, StoreError>;

    /// Messages between `user` and `counterpart`, ascending by id.
    ///
    /// With `after_id`, returns up to `limit` messages newer than it.
    /// Without, returns the newest `limit` messages.
    async fn history(
        &self,
        user: UserId,
        counterpart: UserId,
        after_id: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Every conversation of `user`, newest activity first.
    async fn conversations(&self, user: UserId) -> Result<Vec<ConversationSummary>, StoreError>;

    /// One conversation of `user`, or `None` if no message was exchanged yet.
    async fn conversation(&self, user: UserId, counterpart: UserId) -> Result<Option<ConversationSummary>, StoreError>;

    /// Flag unread messages from `counterpart` to `reader` with id <= `up_to`.
    /// Returns how many rows were newly flagged.
    async fn mark_read(&self, reader: UserId, counterpart: UserId, up_to: MessageId) -> Result<u64, StoreError>;

    /// Unread messages addressed to `user` across all conversations.
    async fn unread_total(&self, user: UserId) -> Result<u64, StoreError>;

    /// Newest message id sent by `sender` to `receiver`.
    async fn latest_from(&self, sender: UserId, receiver: UserId) -> Result<Option<MessageId>, StoreError>;
}

/// Build a summary from `owner`'s point of view.
pub(crate) fn summarize(owner: UserId, last: &ChatMessage, profile: &UserProfile, unread: u64) -> ConversationSummary {
    ConversationSummary {
        user_id: profile.id,
        username: profile.name.clone(),
        avatar: profile.avatar_url.clone(),
        last_message_id: last.id,
        last_message: last.content.clone(),
        file_url: last.file_url.clone(),
        message_type: last.message_type,
        timestamp: last.timestamp,
        is_sender: last.sender_id == owner,
        unread_count: unread,
    }
}

/// Newest activity first; ties broken by the higher message id.
pub(crate) fn sort_by_activity(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then(b.last_message_id.cmp(&a.last_message_id))
    });
}
