use super::*;
use crate::config::ServerConfig;
use crate::state::test_helpers::*;
use crate::store::{MemoryMessageStore, NewMessage};
use async_trait::async_trait;
use events::{ChatMessage, ConversationSummary};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::time::{Duration, timeout};

#[tokio::test]
async fn mark_read_notifies_counterpart_and_refreshes_reader() {
    let state = test_app_state();
    let first = send_text(&state, ALICE, BOB, "1").await;
    let second = send_text(&state, ALICE, BOB, "2").await;
    let (_a, mut alice) = connect(&state, ALICE).await;
    let (_b, mut bob) = connect(&state, BOB).await;

    let read = state.receipts.mark_read(BOB, ALICE, second.id).await.unwrap();
    assert_eq!(read, 2);

    let OutboundEvent::ReadReceipt(receipt) = recv_event(&mut alice).await else {
        panic!("expected read_receipt");
    };
    assert_eq!(receipt, ReadReceipt::new(BOB, ALICE, second.id, 2));
    assert_eq!(receipt.chat_id, BOB);
    assert_no_event(&mut alice).await;

    let OutboundEvent::ConversationUpdate(update) = recv_event(&mut bob).await else {
        panic!("expected conversation_update");
    };
    assert_eq!(update.user_id, ALICE);
    assert_eq!(update.conversation.unread_count, 0);
    assert_eq!(update.unread_delta, -2);

    let history = state.store.history(BOB, ALICE, None, 10).await.unwrap();
    assert!(history.iter().all(|m| m.is_read));
    assert!(first.id < second.id);
}

#[tokio::test]
async fn repeated_receipt_is_idempotent_and_silent() {
    let state = test_app_state();
    let msg = send_text(&state, ALICE, BOB, "hi").await;
    state.receipts.mark_read(BOB, ALICE, msg.id).await.unwrap();
    let (_a, mut alice) = connect(&state, ALICE).await;
    let (_b, mut bob) = connect(&state, BOB).await;

    assert_eq!(state.receipts.mark_read(BOB, ALICE, msg.id).await.unwrap(), 0);

    assert_no_event(&mut alice).await;
    assert_no_event(&mut bob).await;
    assert_eq!(state.store.unread_total(BOB).await.unwrap(), 0);
}

#[tokio::test]
async fn partial_marker_leaves_newer_messages_unread() {
    let state = test_app_state();
    let first = send_text(&state, ALICE, BOB, "1").await;
    send_text(&state, ALICE, BOB, "2").await;

    assert_eq!(state.receipts.mark_read(BOB, ALICE, first.id).await.unwrap(), 1);
    assert_eq!(state.store.unread_total(BOB).await.unwrap(), 1);
}

#[tokio::test]
async fn receipt_only_flags_messages_from_that_counterpart() {
    let state = test_app_state();
    send_text(&state, CAROL, BOB, "from carol").await;
    let from_alice = send_text(&state, ALICE, BOB, "from alice").await;

    assert_eq!(state.receipts.mark_read(BOB, ALICE, from_alice.id).await.unwrap(), 1);
    assert_eq!(state.store.unread_total(BOB).await.unwrap(), 1);
}

#[tokio::test]
async fn malformed_receipts_are_rejected() {
    let state = test_app_state();
    let err = state.receipts.mark_read(BOB, BOB, 1).await.unwrap_err();
    assert!(matches!(err, ReceiptError::InvalidPayload(_)));
    assert_eq!(err.error_code(), "E_INVALID_PAYLOAD");
    assert!(state.receipts.mark_read(BOB, ALICE, 0).await.is_err());
}

#[tokio::test]
async fn mark_all_read_uses_latest_from_counterpart() {
    let state = test_app_state();
    send_text(&state, ALICE, BOB, "1").await;
    send_text(&state, ALICE, BOB, "2").await;
    send_text(&state, BOB, ALICE, "reply").await;

    assert_eq!(state.receipts.mark_all_read(BOB, ALICE).await.unwrap(), 2);
    assert_eq!(state.receipts.mark_all_read(BOB, ALICE).await.unwrap(), 0);
    assert_eq!(state.receipts.mark_all_read(BOB, CAROL).await.unwrap(), 0);
    // Alice's unread reply is untouched.
    assert_eq!(state.store.unread_total(ALICE).await.unwrap(), 1);
}

// =============================================================================
// ordering against concurrent sends
// =============================================================================

/// Seeded store that, once armed, parks the next summary read for bob after
/// computing it, until resumed.
struct PausingStore {
    inner: MemoryMessageStore,
    armed: AtomicBool,
    paused: Notify,
    resume: Notify,
}

impl PausingStore {
    fn new() -> Self {
        Self { inner: seeded_store(), armed: AtomicBool::new(false), paused: Notify::new(), resume: Notify::new() }
    }
}

#[async_trait]
impl MessageStore for PausingStore {
    async fn insert_message(&self, new: NewMessage) -> Result<ChatMessage, StoreError> {
        self.inner.insert_message(new).await
    }

    async fn history(
        &self,
        user: UserId,
        counterpart: UserId,
        after_id: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.inner.history(user, counterpart, after_id, limit).await
    }

    async fn conversations(&self, user: UserId) -> Result<Vec<ConversationSummary>, StoreError> {
        self.inner.conversations(user).await
    }

    async fn conversation(&self, user: UserId, counterpart: UserId) -> Result<Option<ConversationSummary>, StoreError> {
        let summary = self.inner.conversation(user, counterpart).await;
        if user == BOB && self.armed.swap(false, Ordering::SeqCst) {
            self.paused.notify_one();
            self.resume.notified().await;
        }
        summary
    }

    async fn mark_read(&self, reader: UserId, counterpart: UserId, up_to: MessageId) -> Result<u64, StoreError> {
        self.inner.mark_read(reader, counterpart, up_to).await
    }

    async fn unread_total(&self, user: UserId) -> Result<u64, StoreError> {
        self.inner.unread_total(user).await
    }

    async fn latest_from(&self, sender: UserId, receiver: UserId) -> Result<Option<MessageId>, StoreError> {
        self.inner.latest_from(sender, receiver).await
    }
}

#[tokio::test]
async fn read_during_send_is_never_followed_by_a_stale_count() {
    let store = Arc::new(PausingStore::new());
    let state = test_app_state_over(ServerConfig::default(), store.clone());
    let (_b, mut bob) = connect(&state, BOB).await;
    store.armed.store(true, Ordering::SeqCst);

    let sender = state.clone();
    let send = tokio::spawn(async move { send_text(&sender, ALICE, BOB, "hi").await });
    timeout(Duration::from_millis(500), store.paused.notified())
        .await
        .expect("send should reach bob's summary recompute");

    // Bob reads while the send still holds its recomputed summary.
    let reader = state.clone();
    let read = tokio::spawn(async move { reader.receipts.mark_all_read(BOB, ALICE).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!read.is_finished(), "read should wait for the in-flight send");

    store.resume.notify_one();
    let sent = send.await.expect("send task");
    assert_eq!(read.await.expect("read task").unwrap(), 1);

    let events = recv_events(&mut bob, 3).await;
    assert_eq!(events[0], OutboundEvent::Message(sent));
    let counts: Vec<u64> = events[1..]
        .iter()
        .map(|event| match event {
            OutboundEvent::ConversationUpdate(update) => update.conversation.unread_count,
            other => panic!("expected conversation_update, got {other:?}"),
        })
        .collect();
    assert_eq!(counts, vec![1, 0]);
    assert_no_event(&mut bob).await;
    assert_eq!(state.store.unread_total(BOB).await.unwrap(), 0);
}
