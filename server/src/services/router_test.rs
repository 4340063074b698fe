use super::*;
use crate::config::{SendRateConfig, ServerConfig};
use crate::state::test_helpers::*;
use events::ReadReceipt;
use std::time::Duration;
use uuid::Uuid;

fn limits() -> PayloadLimits {
    PayloadLimits { max_content_chars: 10, max_attachment_bytes: 100 }
}

// =============================================================================
// validate_request
// =============================================================================

#[test]
fn text_is_trimmed_and_must_not_be_empty() {
    let new = validate_request(ALICE, &text_to(BOB, "  hi  "), &limits()).unwrap();
    assert_eq!(new.content, "hi");
    assert_eq!(new.kind, MessageKind::Text);

    let err = validate_request(ALICE, &text_to(BOB, "   "), &limits()).unwrap_err();
    assert!(matches!(err, RouterError::InvalidPayload(_)));
    assert_eq!(err.error_code(), "E_INVALID_PAYLOAD");
    assert!(!err.retryable());
}

#[test]
fn content_limit_counts_characters() {
    assert!(validate_request(ALICE, &text_to(BOB, "éééééééééé"), &limits()).is_ok());
    assert!(validate_request(ALICE, &text_to(BOB, "01234567890"), &limits()).is_err());
}

#[test]
fn self_sends_and_missing_receiver_are_rejected() {
    assert!(validate_request(ALICE, &text_to(ALICE, "me"), &limits()).is_err());
    assert!(validate_request(ALICE, &text_to(Uuid::nil(), "who"), &limits()).is_err());
}

#[test]
fn links_must_be_http() {
    let link = |content: &str| SendRequest {
        message_type: MessageKind::Link,
        ..text_to(BOB, content)
    };
    let generous = PayloadLimits { max_content_chars: 100, ..limits() };
    assert!(validate_request(ALICE, &link("https://rust-lang.org"), &generous).is_ok());
    assert!(validate_request(ALICE, &link("javascript:alert(1)"), &generous).is_err());
}

#[test]
fn text_drops_stray_attachment_fields() {
    let request = SendRequest { file_url: Some("https://x.test/a.png".into()), ..text_to(BOB, "hi") };
    let new = validate_request(ALICE, &request, &limits()).unwrap();
    assert!(new.file_url.is_none());
}

#[test]
fn attachments_carry_metadata_and_optional_caption() {
    let request = SendRequest {
        receiver_id: BOB,
        message_type: MessageKind::Image,
        file_url: Some(" https://cdn.test/cat.png ".into()),
        file_size: Some(42),
        file_type: Some("image/png".into()),
        ..SendRequest::default()
    };
    let new = validate_request(ALICE, &request, &limits()).unwrap();
    assert_eq!(new.content, "");
    assert_eq!(new.file_url.as_deref(), Some("https://cdn.test/cat.png"));
    assert_eq!(new.file_size, Some(42));

    let missing_url = SendRequest { file_url: None, ..request };
    assert!(validate_request(ALICE, &missing_url, &limits()).is_err());
}

// =============================================================================
// submit
// =============================================================================

#[tokio::test]
async fn submit_delivers_to_every_session_of_both_participants() {
    let state = test_app_state();
    let (_a1, mut a1) = connect(&state, ALICE).await;
    let (_a2, mut a2) = connect(&state, ALICE).await;
    let (_b1, mut b1) = connect(&state, BOB).await;
    let (_c1, mut c1) = connect(&state, CAROL).await;

    let sent = send_text(&state, ALICE, BOB, "hello").await;

    for rx in [&mut a1, &mut a2, &mut b1] {
        let events = recv_events(rx, 2).await;
        assert_eq!(events[0], OutboundEvent::Message(sent.clone()));
        assert!(matches!(&events[1], OutboundEvent::ConversationUpdate(_)));
        assert_no_event(rx).await;
    }
    assert_no_event(&mut c1).await;
}

#[tokio::test]
async fn submit_updates_summaries_for_each_side() {
    let state = test_app_state();
    let (_a, mut a) = connect(&state, ALICE).await;
    let (_b, mut b) = connect(&state, BOB).await;

    send_text(&state, ALICE, BOB, "one").await;
    let second = send_text(&state, ALICE, BOB, "two").await;

    let OutboundEvent::ConversationUpdate(bob_view) = recv_events(&mut b, 4).await.pop().unwrap() else {
        panic!("expected conversation_update");
    };
    assert_eq!(bob_view.user_id, ALICE);
    assert_eq!(bob_view.conversation.unread_count, 2);
    assert_eq!(bob_view.conversation.last_message_id, second.id);
    assert_eq!(bob_view.unread_delta, 1);

    let OutboundEvent::ConversationUpdate(alice_view) = recv_events(&mut a, 4).await.pop().unwrap() else {
        panic!("expected conversation_update");
    };
    assert!(alice_view.conversation.is_sender);
    assert_eq!(alice_view.conversation.unread_count, 0);
}

#[tokio::test]
async fn offline_receiver_still_gets_durable_message() {
    let state = test_app_state();
    let (_a, mut a) = connect(&state, ALICE).await;

    let sent = send_text(&state, ALICE, BOB, "are you there").await;

    assert_eq!(recv_message(&mut a).await, sent);
    let history = state.store.history(BOB, ALICE, None, 10).await.unwrap();
    assert_eq!(history, vec![sent]);
}

#[tokio::test]
async fn invalid_payload_persists_and_delivers_nothing() {
    let state = test_app_state();
    let (_a, mut a) = connect(&state, ALICE).await;
    let (_b, mut b) = connect(&state, BOB).await;

    let err = state.router.submit(ALICE, text_to(BOB, "")).await.unwrap_err();

    assert!(matches!(err, RouterError::InvalidPayload(_)));
    assert_no_event(&mut a).await;
    assert_no_event(&mut b).await;
    assert!(state.store.history(ALICE, BOB, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_receiver_is_a_store_error() {
    let state = test_app_state();
    let stranger = Uuid::from_u128(0x5742);
    let err = state.router.submit(ALICE, text_to(stranger, "hi")).await.unwrap_err();
    assert!(matches!(err, RouterError::Store(StoreError::UnknownUser(id)) if id == stranger));
    assert_eq!(err.error_code(), "E_UNKNOWN_USER");
}

#[tokio::test]
async fn sends_beyond_the_rate_limit_are_retryable_errors() {
    let config = ServerConfig {
        send_rate: SendRateConfig { limit: 2, window: Duration::from_secs(60) },
        ..ServerConfig::default()
    };
    let state = test_app_state_with(config);

    send_text(&state, ALICE, BOB, "1").await;
    send_text(&state, ALICE, BOB, "2").await;
    let err = state.router.submit(ALICE, text_to(BOB, "3")).await.unwrap_err();

    assert!(matches!(err, RouterError::RateLimited(_)));
    assert!(err.retryable());
    // Other senders are unaffected.
    send_text(&state, BOB, ALICE, "fine").await;
}

#[tokio::test]
async fn concurrent_sends_arrive_in_id_order_everywhere() {
    let state = test_app_state();
    let (_a, mut a) = connect(&state, ALICE).await;
    let (_b, mut b) = connect(&state, BOB).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let state = state.clone();
        let (from, to) = if i % 2 == 0 { (ALICE, BOB) } else { (BOB, ALICE) };
        tasks.push(tokio::spawn(async move {
            send_text(&state, from, to, &format!("m{i}")).await
        }));
    }
    for task in tasks {
        task.await.expect("send task");
    }

    for rx in [&mut a, &mut b] {
        let mut ids = Vec::new();
        while ids.len() < 20 {
            ids.push(recv_message(rx).await.id);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids out of order: {ids:?}");
    }
}

#[tokio::test]
async fn dead_session_does_not_block_delivery_or_receipts() {
    let state = test_app_state();
    let mut live = Vec::new();
    for _ in 0..3 {
        live.push(connect(&state, BOB).await);
    }
    let (dead, dead_rx) = connect(&state, BOB).await;
    drop(dead_rx);

    let sent = send_text(&state, ALICE, BOB, "still here").await;
    for (_, rx) in &mut live {
        assert_eq!(recv_message(rx).await, sent);
    }
    assert!(!state.registry.is_registered(dead).await);

    // Bob's reply is read by alice: the receipt reaches every live session.
    let reply = send_text(&state, BOB, ALICE, "ok").await;
    state.receipts.mark_read(ALICE, BOB, reply.id).await.unwrap();

    for (_, rx) in &mut live {
        let receipt = loop {
            if let OutboundEvent::ReadReceipt(receipt) = recv_event(rx).await {
                break receipt;
            }
        };
        assert_eq!(receipt, ReadReceipt::new(ALICE, BOB, reply.id, 1));
    }
    assert_eq!(state.registry.connections_for(BOB).await.len(), 3);
}

#[tokio::test]
async fn store_failure_fails_the_send_and_delivers_nothing() {
    let state = test_app_state_over(ServerConfig::default(), Arc::new(FailingInsertStore::new()));
    let (_a, mut a) = connect(&state, ALICE).await;
    let (_b, mut b) = connect(&state, BOB).await;

    let err = state.router.submit(ALICE, text_to(BOB, "lost")).await.unwrap_err();

    assert!(matches!(err, RouterError::Store(StoreError::Database(_))));
    assert_eq!(err.error_code(), "E_DATABASE");
    assert!(err.retryable());
    assert_no_event(&mut a).await;
    assert_no_event(&mut b).await;
    assert!(state.store.history(ALICE, BOB, None, 10).await.unwrap().is_empty());
}
