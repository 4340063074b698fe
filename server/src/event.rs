//! Structured error events for the live channel.
//!
//! DESIGN
//! ======
//! Every failure that reaches a client travels as an outbound `error` event
//! carrying a grepable code and a retryable flag. Service error enums
//! implement [`ErrorCode`] so the websocket layer never builds codes by hand.

use events::{ErrorEvent, OutboundEvent};

/// Grepable error code and retryable flag for structured error events.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Build an outbound error event from a typed error.
#[must_use]
pub fn error_event(err: &(impl ErrorCode + ?Sized), client_ref: Option<String>) -> OutboundEvent {
    OutboundEvent::Error(ErrorEvent {
        code: err.error_code().to_owned(),
        message: err.to_string(),
        retryable: err.retryable(),
        client_ref,
    })
}

/// Error for inbound text that does not decode into a known event.
#[derive(Debug, thiserror::Error)]
#[error("invalid payload: {0}")]
pub struct MalformedEvent(#[from] pub events::CodecError);

impl ErrorCode for MalformedEvent {
    fn error_code(&self) -> &'static str {
        "E_INVALID_PAYLOAD"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("slow down")]
    struct Busy;

    impl ErrorCode for Busy {
        fn error_code(&self) -> &'static str {
            "E_BUSY"
        }

        fn retryable(&self) -> bool {
            true
        }
    }

    #[test]
    fn error_event_carries_code_message_and_retryable() {
        let OutboundEvent::Error(err) = error_event(&Busy, Some("tmp-1".into())) else {
            panic!("expected error event");
        };
        assert_eq!(err.code, "E_BUSY");
        assert_eq!(err.message, "slow down");
        assert!(err.retryable);
        assert_eq!(err.client_ref.as_deref(), Some("tmp-1"));
    }

    #[test]
    fn malformed_event_is_not_retryable() {
        let codec = events::decode_inbound("{").expect_err("should not decode");
        let OutboundEvent::Error(err) = error_event(&MalformedEvent(codec), None) else {
            panic!("expected error event");
        };
        assert_eq!(err.code, "E_INVALID_PAYLOAD");
        assert!(!err.retryable);
        assert!(err.message.starts_with("invalid payload"));
    }
}
