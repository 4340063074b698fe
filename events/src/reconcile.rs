//! Client-side reconciliation of optimistic sends with canonical echoes.
//!
//! DESIGN
//! ======
//! A client renders its own message immediately as a `Pending` entry and
//! transmits the send request. The server echoes the canonical message to
//! every connection of the sender; when the echo arrives it replaces the
//! pending entry in place. Matching is tolerant: same sender, same content,
//! and timestamps within `match_window_ms` of each other.
//!
//! Each staged send moves through `Pending -> Confirmed | Failed`. A failed
//! transmit removes the entry; nothing is retried automatically.
//!
//! An echo that matches nothing is appended. Rendering a duplicate is
//! acceptable, losing a message is not.

use std::collections::HashMap;

use crate::{ChatMessage, InboundEvent, MessageId, MessageKind, OutboundEvent, ReadReceipt, SendRequest, UserId};

pub const DEFAULT_MATCH_WINDOW_MS: i64 = 1_000;
pub const DEFAULT_PENDING_TIMEOUT_MS: i64 = 10_000;

/// A locally rendered message that has not been confirmed yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMessage {
    pub local_id: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub message_type: MessageKind,
    pub file_url: Option<String>,
    /// Client clock at staging time, milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// One rendered row of a chat view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    Pending(PendingMessage),
    Confirmed(ChatMessage),
}

impl Entry {
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Pending(p) => &p.content,
            Self::Confirmed(m) => &m.content,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Canonical id, if confirmed.
    #[must_use]
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::Pending(_) => None,
            Self::Confirmed(m) => Some(m.id),
        }
    }
}

/// Lifecycle of one staged send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendState {
    Pending,
    Confirmed(MessageId),
    Failed(String),
}

/// What applying a server event did to the view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    /// A pending entry was swapped for its canonical echo.
    Replaced { local_id: String, index: usize },
    /// A canonical message was added as a new row.
    Appended { index: usize },
    /// A canonical message already present was seen again.
    Duplicate,
    /// A pending entry was removed because the server rejected it.
    Failed { local_id: String },
    /// This many of our sent messages flipped to read.
    ReadMarked(usize),
    /// The event does not concern this view.
    Ignored,
}

/// One open conversation as a client renders it.
#[derive(Clone, Debug)]
pub struct ChatView {
    me: UserId,
    counterpart: UserId,
    entries: Vec<Entry>,
    states: HashMap<String, SendState>,
    match_window_ms: i64,
    pending_timeout_ms: i64,
    next_local: u64,
}

impl ChatView {
    #[must_use]
    pub fn new(me: UserId, counterpart: UserId) -> Self {
        Self {
            me,
            counterpart,
            entries: Vec::new(),
            states: HashMap::new(),
            match_window_ms: DEFAULT_MATCH_WINDOW_MS,
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
            next_local: 0,
        }
    }

    #[must_use]
    pub fn with_windows(mut self, match_window_ms: i64, pending_timeout_ms: i64) -> Self {
        self.match_window_ms = match_window_ms;
        self.pending_timeout_ms = pending_timeout_ms;
        self
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    #[must_use]
    pub fn state_of(&self, local_id: &str) -> Option<&SendState> {
        self.states.get(local_id)
    }

    /// Highest canonical id rendered; the `after_id` for a reconnect catch-up.
    #[must_use]
    pub fn last_confirmed_id(&self) -> Option<MessageId> {
        self.entries.iter().filter_map(Entry::id).max()
    }

    /// Stage a typed line. Content that is a bare http(s) URL becomes a link.
    pub fn stage_text(&mut self, content: &str, now_ms: i64) -> (String, InboundEvent) {
        let content = content.trim();
        let message_type = if looks_like_link(content) { MessageKind::Link } else { MessageKind::Text };
        let request = SendRequest {
            receiver_id: self.counterpart,
            content: content.to_owned(),
            message_type,
            ..SendRequest::default()
        };
        self.stage(request, now_ms)
    }

    /// Render `request` optimistically and return the event to transmit.
    ///
    /// The returned local id is also set as the request's `client_ref`.
    pub fn stage(&mut self, mut request: SendRequest, now_ms: i64) -> (String, InboundEvent) {
        self.next_local += 1;
        let local_id = format!("temp-{now_ms}-{}", self.next_local);

        request.receiver_id = self.counterpart;
        request.content = request.content.trim().to_owned();
        request.client_ref = Some(local_id.clone());

        self.entries.push(Entry::Pending(PendingMessage {
            local_id: local_id.clone(),
            sender_id: self.me,
            receiver_id: self.counterpart,
            content: request.content.clone(),
            message_type: request.message_type,
            file_url: request.file_url.clone(),
            created_at: now_ms,
        }));
        self.states.insert(local_id.clone(), SendState::Pending);

        (local_id, InboundEvent::Message(request))
    }

    /// The transmit did not go out (or the server rejected it). Removes the
    /// pending entry and records the failure.
    pub fn transmit_failed(&mut self, local_id: &str, reason: impl Into<String>) -> Option<PendingMessage> {
        let index = self
            .entries
            .iter()
            .position(|e| matches!(e, Entry::Pending(p) if p.local_id == local_id))?;
        let Entry::Pending(pending) = self.entries.remove(index) else {
            return None;
        };
        self.states.insert(local_id.to_owned(), SendState::Failed(reason.into()));
        Some(pending)
    }

    /// Apply one server event to the view.
    pub fn apply(&mut self, event: &OutboundEvent, now_ms: i64) -> Applied {
        match event {
            OutboundEvent::Message(msg) => self.apply_message(msg, now_ms),
            OutboundEvent::ReadReceipt(receipt) => self.apply_read_receipt(receipt),
            OutboundEvent::Error(err) => {
                let Some(local_id) = err.client_ref.as_deref() else {
                    return Applied::Ignored;
                };
                match self.transmit_failed(local_id, err.message.clone()) {
                    Some(p) => Applied::Failed { local_id: p.local_id },
                    None => Applied::Ignored,
                }
            }
            _ => Applied::Ignored,
        }
    }

    fn apply_message(&mut self, msg: &ChatMessage, now_ms: i64) -> Applied {
        if !msg.is_between(self.me, self.counterpart) {
            return Applied::Ignored;
        }
        if self.entries.iter().any(|e| e.id() == Some(msg.id)) {
            return Applied::Duplicate;
        }

        if msg.sender_id == self.me {
            if let Some(index) = self.find_pending_match(msg, now_ms) {
                let Entry::Pending(pending) = std::mem::replace(&mut self.entries[index], Entry::Confirmed(msg.clone()))
                else {
                    return Applied::Ignored;
                };
                self.states.insert(pending.local_id.clone(), SendState::Confirmed(msg.id));
                return Applied::Replaced { local_id: pending.local_id, index };
            }
        }

        self.entries.push(Entry::Confirmed(msg.clone()));
        Applied::Appended { index: self.entries.len() - 1 }
    }

    fn find_pending_match(&self, msg: &ChatMessage, now_ms: i64) -> Option<usize> {
        self.entries.iter().position(|e| match e {
            Entry::Pending(p) => self.matches(p, msg, now_ms),
            Entry::Confirmed(_) => false,
        })
    }

    fn matches(&self, pending: &PendingMessage, msg: &ChatMessage, now_ms: i64) -> bool {
        pending.sender_id == msg.sender_id
            && pending.content == msg.content
            && (pending.created_at - msg.timestamp).abs() <= self.match_window_ms
            && now_ms - pending.created_at <= self.pending_timeout_ms
    }

    fn apply_read_receipt(&mut self, receipt: &ReadReceipt) -> Applied {
        if receipt.reader_id != self.counterpart || receipt.counterpart_id != self.me {
            return Applied::Ignored;
        }
        let mut flipped = 0;
        for entry in &mut self.entries {
            if let Entry::Confirmed(m) = entry {
                if m.sender_id == self.me && m.id <= receipt.last_read_id && !m.is_read {
                    m.is_read = true;
                    flipped += 1;
                }
            }
        }
        Applied::ReadMarked(flipped)
    }

    /// Merge a REST history fetch (initial load or reconnect catch-up).
    ///
    /// Confirmed rows are unioned by id and kept in id order. Pending rows
    /// that match a fetched message are confirmed; the rest stay pending at
    /// the tail in their original order.
    pub fn merge_history(&mut self, history: Vec<ChatMessage>, now_ms: i64) {
        let mut confirmed: Vec<ChatMessage> = Vec::new();
        let mut pending: Vec<PendingMessage> = Vec::new();
        for entry in self.entries.drain(..) {
            match entry {
                Entry::Confirmed(m) => confirmed.push(m),
                Entry::Pending(p) => pending.push(p),
            }
        }

        for msg in history {
            if !msg.is_between(self.me, self.counterpart) {
                continue;
            }
            if let Some(existing) = confirmed.iter_mut().find(|m| m.id == msg.id) {
                *existing = msg;
                continue;
            }
            if msg.sender_id == self.me {
                if let Some(pos) = pending.iter().position(|p| self.matches(p, &msg, now_ms)) {
                    let p = pending.remove(pos);
                    self.states.insert(p.local_id, SendState::Confirmed(msg.id));
                }
            }
            confirmed.push(msg);
        }

        confirmed.sort_by_key(|m| m.id);
        self.entries = confirmed.into_iter().map(Entry::Confirmed).collect();
        self.entries.extend(pending.into_iter().map(Entry::Pending));
    }

    /// Pending entries older than the timeout. They are never matched again;
    /// a UI can offer a manual resend.
    #[must_use]
    pub fn stale_pending(&self, now_ms: i64) -> Vec<&PendingMessage> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Entry::Pending(p) if now_ms - p.created_at > self.pending_timeout_ms => Some(p),
                _ => None,
            })
            .collect()
    }
}

fn looks_like_link(content: &str) -> bool {
    (content.starts_with("http://") || content.starts_with("https://"))
        && content.len() > "https://".len()
        && !content.contains(char::is_whitespace)
}

#[cfg(test)]
#[path = "reconcile_test.rs"]
mod tests;
