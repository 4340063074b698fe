//! In-memory message store for development mode and tests.
//!
//! A single mutex guards the message log, so id assignment and append are
//! one atomic step just like the Postgres sequence + insert.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use events::{ChatMessage, ConversationSummary, MessageId, UserId, now_ms};

use super::{MessageStore, NewMessage, StoreError, UserProfile, sort_by_activity, summarize};

#[derive(Default)]
pub struct MemoryMessageStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: MessageId,
    /// Append-only log, ascending by id.
    messages: Vec<ChatMessage>,
    users: HashMap<UserId, UserProfile>,
}

impl Inner {
    fn unread(&self, reader: UserId, counterpart: UserId) -> u64 {
        let count = self
            .messages
            .iter()
            .filter(|m| m.sender_id == counterpart && m.receiver_id == reader && !m.is_read)
            .count();
        u64::try_from(count).unwrap_or(u64::MAX)
    }

    fn last_between(&self, a: UserId, b: UserId) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.is_between(a, b))
    }
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with known users.
    #[must_use]
    pub fn with_users(users: impl IntoIterator<Item = UserProfile>) -> Self {
        let store = Self::new();
        for user in users {
            store.upsert_user(user);
        }
        store
    }

    pub fn upsert_user(&self, profile: UserProfile) {
        self.lock().users.insert(profile.id, profile);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert_message(&self, new: NewMessage) -> Result<ChatMessage, StoreError> {
        let mut inner = self.lock();
        for id in [new.sender_id, new.receiver_id] {
            if !inner.users.contains_key(&id) {
                return Err(StoreError::UnknownUser(id));
            }
        }

        inner.next_id += 1;
        let message = ChatMessage {
            id: inner.next_id,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            content: new.content,
            message_type: new.kind,
            file_url: new.file_url,
            file_size: new.file_size,
            file_type: new.file_type,
            timestamp: now_ms(),
            is_read: false,
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn history(
        &self,
        user: UserId,
        counterpart: UserId,
        after_id: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let inner = self.lock();
        let between = inner.messages.iter().filter(|m| m.is_between(user, counterpart));

        let out = match after_id {
            Some(after) => between.filter(|m| m.id > after).take(limit).cloned().collect(),
            None => {
                let mut newest: Vec<ChatMessage> = between.rev().take(limit).cloned().collect();
                newest.reverse();
                newest
            }
        };
        Ok(out)
    }

    async fn conversations(&self, user: UserId) -> Result<Vec<ConversationSummary>, StoreError> {
        let inner = self.lock();
        let mut latest: HashMap<UserId, &ChatMessage> = HashMap::new();
        for msg in &inner.messages {
            if let Some(counterpart) = msg.counterpart_of(user) {
                latest.insert(counterpart, msg);
            }
        }

        let mut out: Vec<ConversationSummary> = latest
            .into_iter()
            .filter_map(|(counterpart, last)| {
                // Counterparts without a profile are skipped.
                let profile = inner.users.get(&counterpart)?;
                Some(summarize(user, last, profile, inner.unread(user, counterpart)))
            })
            .collect();
        sort_by_activity(&mut out);
        Ok(out)
    }

    async fn conversation(&self, user: UserId, counterpart: UserId) -> Result<Option<ConversationSummary>, StoreError> {
        let inner = self.lock();
        let Some(last) = inner.last_between(user, counterpart) else {
            return Ok(None);
        };
        let Some(profile) = inner.users.get(&counterpart) else {
            return Ok(None);
        };
        Ok(Some(summarize(user, last, profile, inner.unread(user, counterpart))))
    }

    async fn mark_read(&self, reader: UserId, counterpart: UserId, up_to: MessageId) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let mut flagged = 0u64;
        for msg in &mut inner.messages {
            if msg.sender_id == counterpart && msg.receiver_id == reader && msg.id <= up_to && !msg.is_read {
                msg.is_read = true;
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    async fn unread_total(&self, user: UserId) -> Result<u64, StoreError> {
        let inner = self.lock();
        let count = inner
            .messages
            .iter()
            .filter(|m| m.receiver_id == user && !m.is_read)
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn latest_from(&self, sender: UserId, receiver: UserId) -> Result<Option<MessageId>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .messages
            .iter()
            .rev()
            .find(|m| m.sender_id == sender && m.receiver_id == receiver)
            .map(|m| m.id))
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
