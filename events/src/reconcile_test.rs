use super::*;
use crate::ErrorEvent;
use uuid::Uuid;

const ME: Uuid = Uuid::from_u128(1);
const PEER: Uuid = Uuid::from_u128(2);
const T: i64 = 1_700_000_000_000;

fn canonical(id: MessageId, sender: UserId, content: &str, timestamp: i64) -> ChatMessage {
    let receiver = if sender == ME { PEER } else { ME };
    ChatMessage {
        id,
        sender_id: sender,
        receiver_id: receiver,
        content: content.to_owned(),
        message_type: MessageKind::Text,
        file_url: None,
        file_size: None,
        file_type: None,
        timestamp,
        is_read: false,
    }
}

// =============================================================================
// Staging
// =============================================================================

#[test]
fn stage_text_renders_pending_and_tags_client_ref() {
    let mut view = ChatView::new(ME, PEER);
    let (local_id, event) = view.stage_text("  hello  ", T);

    let InboundEvent::Message(req) = event else {
        panic!("expected message event");
    };
    assert_eq!(req.receiver_id, PEER);
    assert_eq!(req.content, "hello");
    assert_eq!(req.message_type, MessageKind::Text);
    assert_eq!(req.client_ref.as_deref(), Some(local_id.as_str()));

    assert_eq!(view.entries().len(), 1);
    assert!(view.entries()[0].is_pending());
    assert_eq!(view.state_of(&local_id), Some(&SendState::Pending));
}

#[test]
fn stage_text_detects_links() {
    let mut view = ChatView::new(ME, PEER);
    let (_, event) = view.stage_text("https://example.com/paper.pdf", T);
    let InboundEvent::Message(req) = event else {
        panic!("expected message event");
    };
    assert_eq!(req.message_type, MessageKind::Link);

    let (_, event) = view.stage_text("see https://example.com", T);
    let InboundEvent::Message(req) = event else {
        panic!("expected message event");
    };
    assert_eq!(req.message_type, MessageKind::Text);
}

#[test]
fn local_ids_are_unique_within_the_same_millisecond() {
    let mut view = ChatView::new(ME, PEER);
    let (a, _) = view.stage_text("one", T);
    let (b, _) = view.stage_text("two", T);
    assert_ne!(a, b);
}

// =============================================================================
// Echo matching
// =============================================================================

#[test]
fn echo_within_window_replaces_pending_in_place() {
    let mut view = ChatView::new(ME, PEER);
    view.apply(&OutboundEvent::Message(canonical(1, PEER, "hey", T - 5_000)), T);
    let (local_id, _) = view.stage_text("hello", T);

    let applied = view.apply(&OutboundEvent::Message(canonical(2, ME, "hello", T + 200)), T + 250);

    assert_eq!(applied, Applied::Replaced { local_id: local_id.clone(), index: 1 });
    assert_eq!(view.entries().len(), 2, "exactly one rendered entry for the send");
    assert_eq!(view.entries()[1].id(), Some(2));
    assert_eq!(view.state_of(&local_id), Some(&SendState::Confirmed(2)));
}

#[test]
fn echo_outside_window_is_appended() {
    let mut view = ChatView::new(ME, PEER);
    view.stage_text("hello", T);

    let applied = view.apply(&OutboundEvent::Message(canonical(3, ME, "hello", T + 5_000)), T + 5_000);

    assert_eq!(applied, Applied::Appended { index: 1 });
    assert_eq!(view.entries().len(), 2);
    assert!(view.entries()[0].is_pending());
}

#[test]
fn echo_with_different_content_does_not_match() {
    let mut view = ChatView::new(ME, PEER);
    view.stage_text("hello", T);

    let applied = view.apply(&OutboundEvent::Message(canonical(3, ME, "hello!", T + 10)), T + 10);
    assert_eq!(applied, Applied::Appended { index: 1 });
}

#[test]
fn identical_pending_sends_match_in_order() {
    let mut view = ChatView::new(ME, PEER);
    let (first, _) = view.stage_text("ok", T);
    let (second, _) = view.stage_text("ok", T + 100);

    let a = view.apply(&OutboundEvent::Message(canonical(10, ME, "ok", T + 150)), T + 150);
    let b = view.apply(&OutboundEvent::Message(canonical(11, ME, "ok", T + 300)), T + 300);

    assert_eq!(a, Applied::Replaced { local_id: first, index: 0 });
    assert_eq!(b, Applied::Replaced { local_id: second, index: 1 });
    assert!(view.entries().iter().all(|e| !e.is_pending()));
}

#[test]
fn stale_pending_is_not_matched() {
    let mut view = ChatView::new(ME, PEER).with_windows(1_000, 2_000);
    view.stage_text("late", T);

    assert_eq!(view.stale_pending(T + 2_500).len(), 1);
    let applied = view.apply(&OutboundEvent::Message(canonical(4, ME, "late", T + 500)), T + 2_500);
    assert_eq!(applied, Applied::Appended { index: 1 });
}

#[test]
fn repeated_canonical_message_is_a_duplicate() {
    let mut view = ChatView::new(ME, PEER);
    let msg = canonical(5, PEER, "yo", T);
    assert_eq!(view.apply(&OutboundEvent::Message(msg.clone()), T), Applied::Appended { index: 0 });
    assert_eq!(view.apply(&OutboundEvent::Message(msg), T), Applied::Duplicate);
    assert_eq!(view.entries().len(), 1);
}

#[test]
fn messages_from_other_conversations_are_ignored() {
    let mut view = ChatView::new(ME, PEER);
    let mut msg = canonical(6, ME, "elsewhere", T);
    msg.receiver_id = Uuid::from_u128(3);
    assert_eq!(view.apply(&OutboundEvent::Message(msg), T), Applied::Ignored);
    assert!(view.entries().is_empty());
}

// =============================================================================
// Failure
// =============================================================================

#[test]
fn transmit_failure_removes_pending_and_records_reason() {
    let mut view = ChatView::new(ME, PEER);
    let (local_id, _) = view.stage_text("offline", T);

    let removed = view.transmit_failed(&local_id, "socket not open").expect("pending removed");
    assert_eq!(removed.content, "offline");
    assert!(view.entries().is_empty());
    assert_eq!(view.state_of(&local_id), Some(&SendState::Failed("socket not open".into())));
    assert!(view.transmit_failed(&local_id, "again").is_none());
}

#[test]
fn server_error_with_client_ref_fails_that_entry() {
    let mut view = ChatView::new(ME, PEER);
    let (keep, _) = view.stage_text("fine", T);
    let (reject, _) = view.stage_text("bad", T);

    let err = OutboundEvent::Error(ErrorEvent {
        code: "E_INVALID_PAYLOAD".into(),
        message: "content too long".into(),
        retryable: false,
        client_ref: Some(reject.clone()),
    });
    assert_eq!(view.apply(&err, T), Applied::Failed { local_id: reject.clone() });
    assert_eq!(view.entries().len(), 1);
    assert_eq!(view.state_of(&keep), Some(&SendState::Pending));
    assert!(matches!(view.state_of(&reject), Some(SendState::Failed(_))));
}

// =============================================================================
// Read receipts
// =============================================================================

#[test]
fn read_receipt_marks_own_messages_up_to_marker() {
    let mut view = ChatView::new(ME, PEER);
    for (id, sender) in [(1, ME), (2, PEER), (3, ME), (4, ME)] {
        view.apply(&OutboundEvent::Message(canonical(id, sender, "x", T)), T);
    }

    let receipt = OutboundEvent::ReadReceipt(ReadReceipt::new(PEER, ME, 3, 2));
    assert_eq!(view.apply(&receipt, T), Applied::ReadMarked(2));
    assert_eq!(view.apply(&receipt, T), Applied::ReadMarked(0));

    let read: Vec<bool> = view
        .entries()
        .iter()
        .map(|e| match e {
            Entry::Confirmed(m) => m.is_read,
            Entry::Pending(_) => false,
        })
        .collect();
    assert_eq!(read, vec![true, false, true, false]);
}

#[test]
fn read_receipt_for_reverse_direction_is_ignored() {
    let mut view = ChatView::new(ME, PEER);
    view.apply(&OutboundEvent::Message(canonical(1, ME, "x", T)), T);
    let receipt = OutboundEvent::ReadReceipt(ReadReceipt::new(ME, PEER, 1, 1));
    assert_eq!(view.apply(&receipt, T), Applied::Ignored);
}

// =============================================================================
// History merge
// =============================================================================

#[test]
fn merge_history_confirms_matching_pending_and_orders_by_id() {
    let mut view = ChatView::new(ME, PEER);
    view.apply(&OutboundEvent::Message(canonical(9, PEER, "later", T)), T);
    let (matched, _) = view.stage_text("sent while offline", T);
    let (unmatched, _) = view.stage_text("never arrived", T);

    view.merge_history(
        vec![canonical(7, PEER, "earlier", T - 100), canonical(8, ME, "sent while offline", T + 300)],
        T + 400,
    );

    let ids: Vec<Option<MessageId>> = view.entries().iter().map(Entry::id).collect();
    assert_eq!(ids, vec![Some(7), Some(8), Some(9), None]);
    assert_eq!(view.state_of(&matched), Some(&SendState::Confirmed(8)));
    assert_eq!(view.state_of(&unmatched), Some(&SendState::Pending));
    assert_eq!(view.last_confirmed_id(), Some(9));
}

#[test]
fn merge_history_refreshes_existing_rows() {
    let mut view = ChatView::new(ME, PEER);
    view.apply(&OutboundEvent::Message(canonical(1, ME, "x", T)), T);
    let mut read = canonical(1, ME, "x", T);
    read.is_read = true;

    view.merge_history(vec![read], T);

    assert_eq!(view.entries().len(), 1);
    assert!(matches!(&view.entries()[0], Entry::Confirmed(m) if m.is_read));
}
