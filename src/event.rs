//! Chat wire types: what travels over a group chat socket.
//!
//! ARCHITECTURE
//! ============
//! Clients send a single JSON object `{"message": "..."}` per text frame.
//! The server answers with either a chat event `{"message", "username"}`
//! fanned out to the group, or an error event addressed to the sender only.
//!
//! DESIGN
//! ======
//! - Sender identity is never read from the inbound payload. Unknown inbound
//!   fields are ignored, including a client-supplied `username`.
//! - Errors carry a grepable code so clients can branch without parsing text.

use serde::{Deserialize, Serialize};

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Payload key for chat text, inbound and outbound.
pub const FIELD_MESSAGE: &str = "message";

// =============================================================================
// TYPES
// =============================================================================

/// Group identifier as it appears in `/ws/group/{group_id}/`.
pub type GroupId = i64;

/// Authenticated identity attached to a connection. Supplied by the session
/// layer and trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: i64, username: impl Into<String>) -> Self {
        Self { user_id, username: username.into() }
    }
}

/// Ephemeral chat message. Built from an inbound frame, fanned out, dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: Identity,
    pub text: String,
}

/// Inbound client payload. Only `message` is read.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub message: String,
}

impl InboundMessage {
    /// Parse one inbound text frame. The payload must be a JSON object; serde
    /// would otherwise accept `["text"]` as a positional struct.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when the text is not an object carrying a
    /// string `message` field.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(<serde_json::Error as serde::de::Error>::custom(format!(
                "expected a JSON object with a `{FIELD_MESSAGE}` field"
            )));
        }
        serde_json::from_value(value)
    }
}

/// Body of an outbound error event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Everything the server writes to a chat socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    /// Broadcast chat event.
    Chat { message: String, username: String },
    /// Error addressed to the sender of a bad request.
    Error { error: ErrorBody },
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error events.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl Outbound {
    /// Build an error event from a typed error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self::Error { error: ErrorBody { code: err.error_code().to_owned(), message: err.to_string() } }
    }

    /// Text of a chat event, if this is one.
    #[must_use]
    pub fn chat_text(&self) -> Option<&str> {
        match self {
            Self::Chat { message, .. } => Some(message),
            Self::Error { .. } => None,
        }
    }
}

impl From<&ChatMessage> for Outbound {
    fn from(msg: &ChatMessage) -> Self {
        Self::Chat { message: msg.text.clone(), username: msg.sender.username.clone() }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_event_serializes_canonical_shape() {
        let msg = ChatMessage { sender: Identity::new(7, "alice"), text: "hello".into() };
        let value = serde_json::to_value(Outbound::from(&msg)).expect("serialize");
        assert_eq!(value, serde_json::json!({ "message": "hello", "username": "alice" }));
    }

    #[test]
    fn inbound_ignores_client_supplied_username() {
        let inbound = InboundMessage::parse(r#"{"message": "hi", "username": "mallory"}"#).expect("parse");
        assert_eq!(inbound.message, "hi");
    }

    #[test]
    fn inbound_requires_string_message() {
        assert!(InboundMessage::parse(r#"{"text": "hi"}"#).is_err());
        assert!(InboundMessage::parse(r#"{"message": 12}"#).is_err());
        assert!(InboundMessage::parse(r#"{"message": null}"#).is_err());
        assert!(InboundMessage::parse("not json").is_err());
    }

    #[test]
    fn inbound_rejects_non_object_payloads() {
        let err = InboundMessage::parse(r#"["hello"]"#).expect_err("array must be rejected");
        assert!(err.to_string().contains("JSON object"));
        assert!(InboundMessage::parse(r#""hello""#).is_err());
    }

    #[test]
    fn inbound_accepts_empty_message() {
        let inbound = InboundMessage::parse(r#"{"message": ""}"#).expect("parse");
        assert_eq!(inbound.message, "");
    }

    #[test]
    fn error_from_typed() {
        #[derive(Debug, thiserror::Error)]
        #[error("bad payload")]
        struct BadPayload;

        impl ErrorCode for BadPayload {
            fn error_code(&self) -> &'static str {
                "E_BAD_PAYLOAD"
            }
        }

        let event = Outbound::error_from(&BadPayload);
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value, serde_json::json!({ "error": { "code": "E_BAD_PAYLOAD", "message": "bad payload" } }));
        assert_eq!(event.chat_text(), None);
    }

    #[test]
    fn untagged_outbound_deserializes_both_shapes() {
        let chat: Outbound = serde_json::from_str(r#"{"message": "yo", "username": "bob"}"#).expect("chat");
        assert_eq!(chat.chat_text(), Some("yo"));

        let err: Outbound =
            serde_json::from_str(r#"{"error": {"code": "E_X", "message": "nope"}}"#).expect("error");
        assert!(matches!(err, Outbound::Error { .. }));
    }
}
