//! Conversation Aggregator: per-user conversation summaries.
//!
//! DESIGN
//! ======
//! Summaries are never patched in place. Every update re-reads the latest
//! message and counts unread rows from the store, so a dropped event or a
//! replayed receipt cannot drift the badge. `unread_delta` is derived from
//! the operation that triggered the update (+1 for a new incoming message,
//! minus the flagged count for a read) and is advisory only.

use std::sync::Arc;

use events::{ChatMessage, ConversationUpdate, Snapshot, UserId};
use tracing::debug;

use crate::store::{MessageStore, StoreError};

#[derive(Clone)]
pub struct ConversationAggregator {
    store: Arc<dyn MessageStore>,
}

impl ConversationAggregator {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Every conversation of `user`, newest activity first, plus the badge total.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn snapshot(&self, user: UserId) -> Result<Snapshot, StoreError> {
        let conversations = self.store.conversations(user).await?;
        let unread_total = self.store.unread_total(user).await?;
        debug!(%user, conversations = conversations.len(), unread_total, "aggregator: snapshot");
        Ok(Snapshot { conversations, unread_total })
    }

    /// Recompute both participants' summaries after `message` was persisted.
    ///
    /// Returns `(owner, update)` pairs, sender first. A participant without a
    /// resolvable summary (missing profile) is left out.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn apply_new_message(&self, message: &ChatMessage) -> Result<Vec<(UserId, ConversationUpdate)>, StoreError> {
        let mut updates = Vec::with_capacity(2);
        for (owner, counterpart, delta) in [
            (message.sender_id, message.receiver_id, 0),
            (message.receiver_id, message.sender_id, 1),
        ] {
            if let Some(update) = self.recompute(owner, counterpart, delta).await? {
                updates.push((owner, update));
            }
        }
        Ok(updates)
    }

    /// Recompute the reader's summary after `read_count` messages from
    /// `counterpart` were flagged read.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn apply_read_receipt(
        &self,
        reader: UserId,
        counterpart: UserId,
        read_count: u64,
    ) -> Result<Option<ConversationUpdate>, StoreError> {
        let delta = i64::try_from(read_count).map_or(i64::MIN, |n| -n);
        self.recompute(reader, counterpart, delta).await
    }

    async fn recompute(
        &self,
        owner: UserId,
        counterpart: UserId,
        unread_delta: i64,
    ) -> Result<Option<ConversationUpdate>, StoreError> {
        let Some(conversation) = self.store.conversation(owner, counterpart).await? else {
            return Ok(None);
        };
        Ok(Some(ConversationUpdate { user_id: counterpart, conversation, unread_delta }))
    }
}

#[cfg(test)]
#[path = "aggregator_test.rs"]
mod tests;
