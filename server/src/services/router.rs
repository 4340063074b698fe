//! Message Router: validate, persist, summarize, deliver.
//!
//! DESIGN
//! ======
//! `submit` runs four steps for one send:
//! 1. validate the payload (nothing is persisted on failure)
//! 2. persist through the store, which assigns the canonical id
//! 3. recompute both participants' conversation summaries
//! 4. deliver the canonical message to the sender's sessions, then the
//!    receiver's, followed by each side's `conversation_update`
//!
//! ORDERING
//! ========
//! Steps 2 to 4 run under the conversation's stripe in [`ConversationLocks`],
//! shared with the receipt propagator. Sends and reads in one conversation
//! therefore reach every session in store order, while unrelated
//! conversations proceed in parallel. Delivery never blocks on a slow
//! session (see the registry).

use std::sync::Arc;

use events::{ChatMessage, MessageKind, OutboundEvent, SendRequest, UserId};
use tracing::{info, warn};

use crate::config::PayloadLimits;
use crate::event::ErrorCode;
use crate::rate_limit::{RateLimitExceeded, RateLimiter};
use crate::services::aggregator::ConversationAggregator;
use crate::services::attachments::{is_http_url, validate_metadata};
use crate::services::locks::ConversationLocks;
use crate::services::registry::SessionRegistry;
use crate::store::{MessageStore, NewMessage, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for RouterError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "E_INVALID_PAYLOAD",
            Self::RateLimited(e) => e.error_code(),
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::InvalidPayload(_) => false,
            Self::RateLimited(e) => e.retryable(),
            Self::Store(e) => e.retryable(),
        }
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    store: Arc<dyn MessageStore>,
    registry: SessionRegistry,
    aggregator: ConversationAggregator,
    limiter: RateLimiter,
    limits: PayloadLimits,
    locks: ConversationLocks,
}

impl MessageRouter {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: SessionRegistry,
        aggregator: ConversationAggregator,
        limiter: RateLimiter,
        limits: PayloadLimits,
        locks: ConversationLocks,
    ) -> Self {
        Self { store, registry, aggregator, limiter, limits, locks }
    }

    /// Accept one send from an authenticated sender.
    ///
    /// Returns the persisted message. Delivery failures are not errors: the
    /// message is durable once this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] for invalid payloads, rate limiting, or store
    /// failures; nothing is delivered in those cases.
    pub async fn submit(&self, sender: UserId, request: SendRequest) -> Result<ChatMessage, RouterError> {
        let new = validate_request(sender, &request, &self.limits)?;
        self.limiter.check_and_record(sender)?;

        let _guard = self.locks.lock(sender, new.receiver_id).await;

        let message = self.store.insert_message(new).await?;
        info!(id = message.id, sender = %message.sender_id, receiver = %message.receiver_id, kind = message.message_type.as_str(), "router: message persisted");

        // The message is already durable; a failed summary read must not
        // suppress delivery of the message itself.
        let updates = match self.aggregator.apply_new_message(&message).await {
            Ok(updates) => updates,
            Err(e) => {
                warn!(id = message.id, error = %e, "router: summary recompute failed");
                Vec::new()
            }
        };

        let event = OutboundEvent::Message(message.clone());
        self.registry.broadcast(message.sender_id, &event).await;
        self.registry.broadcast(message.receiver_id, &event).await;
        for (owner, update) in updates {
            self.registry
                .broadcast(owner, &OutboundEvent::ConversationUpdate(update))
                .await;
        }

        Ok(message)
    }
}

/// Turn a client send into a storable message.
///
/// # Errors
///
/// Returns [`RouterError::InvalidPayload`] describing the first problem found.
pub fn validate_request(sender: UserId, request: &SendRequest, limits: &PayloadLimits) -> Result<NewMessage, RouterError> {
    if request.receiver_id == sender {
        return Err(RouterError::InvalidPayload("cannot send a message to yourself".into()));
    }
    if request.receiver_id.is_nil() {
        return Err(RouterError::InvalidPayload("receiver_id is required".into()));
    }

    let content = request.content.trim().to_string();
    let chars = content.chars().count();
    if chars > limits.max_content_chars {
        return Err(RouterError::InvalidPayload(format!(
            "content is {chars} characters (max {})",
            limits.max_content_chars
        )));
    }

    let kind = request.message_type;
    match kind {
        MessageKind::Text | MessageKind::Link => {
            if content.is_empty() {
                return Err(RouterError::InvalidPayload("content must not be empty".into()));
            }
            if kind == MessageKind::Link && !is_http_url(&content) {
                return Err(RouterError::InvalidPayload("link content must be an http(s) URL".into()));
            }
            Ok(NewMessage {
                sender_id: sender,
                receiver_id: request.receiver_id,
                content,
                kind,
                file_url: None,
                file_size: None,
                file_type: None,
            })
        }
        MessageKind::Image | MessageKind::File => {
            validate_metadata(
                kind,
                request.file_url.as_deref(),
                request.file_size,
                request.file_type.as_deref(),
                limits,
            )
            .map_err(RouterError::InvalidPayload)?;
            Ok(NewMessage {
                sender_id: sender,
                receiver_id: request.receiver_id,
                content,
                kind,
                file_url: request.file_url.as_ref().map(|u| u.trim().to_string()),
                file_size: request.file_size,
                file_type: request.file_type.clone(),
            })
        }
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
