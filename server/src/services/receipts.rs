//! Read-Receipt Propagator.
//!
//! DESIGN
//! ======
//! `mark_read` flags the reader's unread messages from one counterpart up to
//! a marker id and, only when something actually changed, tells the
//! counterpart's sessions via `read_receipt` and refreshes the reader's own
//! sessions via `conversation_update`. Repeating a receipt flags nothing and
//! sends nothing, so retries are harmless.
//!
//! The store write, recompute and broadcasts run under the same conversation
//! stripe as the router's sends, so a read racing a send cannot be followed
//! by an older unread count.

use std::sync::Arc;

use events::{MessageId, OutboundEvent, ReadReceipt, UserId};
use tracing::{debug, info, warn};

use crate::event::ErrorCode;
use crate::services::aggregator::ConversationAggregator;
use crate::services::locks::ConversationLocks;
use crate::services::registry::SessionRegistry;
use crate::store::{MessageStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for ReceiptError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "E_INVALID_PAYLOAD",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.retryable())
    }
}

#[derive(Clone)]
pub struct ReadReceiptPropagator {
    store: Arc<dyn MessageStore>,
    registry: SessionRegistry,
    aggregator: ConversationAggregator,
    locks: ConversationLocks,
}

impl ReadReceiptPropagator {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: SessionRegistry,
        aggregator: ConversationAggregator,
        locks: ConversationLocks,
    ) -> Self {
        Self { store, registry, aggregator, locks }
    }

    /// Mark messages from `counterpart` to `reader` with id <= `last_read_id`
    /// as read. Returns how many were newly flagged.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError`] for malformed requests or store failures.
    pub async fn mark_read(
        &self,
        reader: UserId,
        counterpart: UserId,
        last_read_id: MessageId,
    ) -> Result<u64, ReceiptError> {
        reject_self(reader, counterpart)?;
        if last_read_id <= 0 {
            return Err(ReceiptError::InvalidPayload("last_read_id must be positive".into()));
        }

        let _guard = self.locks.lock(reader, counterpart).await;
        self.apply(reader, counterpart, last_read_id).await
    }

    /// Mark everything the counterpart has sent so far. Used when history is
    /// fetched with `mark_read=true`.
    ///
    /// # Errors
    ///
    /// See [`ReadReceiptPropagator::mark_read`].
    pub async fn mark_all_read(&self, reader: UserId, counterpart: UserId) -> Result<u64, ReceiptError> {
        reject_self(reader, counterpart)?;

        let _guard = self.locks.lock(reader, counterpart).await;
        match self.store.latest_from(counterpart, reader).await? {
            Some(latest) => self.apply(reader, counterpart, latest).await,
            None => Ok(0),
        }
    }

    /// Flag, notify and refresh. Caller holds the conversation lock.
    async fn apply(&self, reader: UserId, counterpart: UserId, last_read_id: MessageId) -> Result<u64, ReceiptError> {
        let read_count = self.store.mark_read(reader, counterpart, last_read_id).await?;
        if read_count == 0 {
            debug!(%reader, %counterpart, last_read_id, "receipts: nothing new to mark");
            return Ok(0);
        }
        info!(%reader, %counterpart, last_read_id, read_count, "receipts: messages marked read");

        let receipt = ReadReceipt::new(reader, counterpart, last_read_id, read_count);
        self.registry
            .broadcast(counterpart, &OutboundEvent::ReadReceipt(receipt))
            .await;

        match self.aggregator.apply_read_receipt(reader, counterpart, read_count).await {
            Ok(Some(update)) => {
                self.registry
                    .broadcast(reader, &OutboundEvent::ConversationUpdate(update))
                    .await;
            }
            Ok(None) => {}
            Err(e) => warn!(%reader, %counterpart, error = %e, "receipts: summary recompute failed"),
        }

        Ok(read_count)
    }
}

fn reject_self(reader: UserId, counterpart: UserId) -> Result<(), ReceiptError> {
    if counterpart == reader {
        return Err(ReceiptError::InvalidPayload("cannot mark your own messages read".into()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "receipts_test.rs"]
mod tests;
