//! JSON message envelope and inbound frame parsing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────
// Wire Envelope
// ─────────────────────────────────────────────────────────────────

/// Envelope carried in every outbound text frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Message id; equals the outbound message id so retries are identifiable
    pub id: String,

    /// Target conversation
    pub chat_id: String,

    /// Message text
    pub content: String,

    /// When the message was created by the sender
    pub timestamp: DateTime<Utc>,

    /// Sender label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl WireMessage {
    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ─────────────────────────────────────────────────────────────────
// Inbound Parsing
// ─────────────────────────────────────────────────────────────────

/// How an inbound frame was interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFormat {
    /// A well-formed envelope
    Envelope,
    /// Anything else, taken verbatim
    PlainText,
}

/// An inbound frame resolved to a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub sender: Option<String>,
    pub format: InboundFormat,
}

impl InboundMessage {
    /// Interpret a raw text frame
    ///
    /// Envelopes keep their own id, chat and timestamp. Plain text (or JSON
    /// that is not an envelope) lands in `default_chat` with a fresh id and
    /// the receive time.
    pub fn parse(raw: &str, default_chat: &str) -> Self {
        match WireMessage::from_json(raw) {
            Ok(wire) if !wire.chat_id.is_empty() => Self {
                id: wire.id,
                chat_id: wire.chat_id,
                content: wire.content,
                timestamp: wire.timestamp,
                sender: wire.sender,
                format: InboundFormat::Envelope,
            },
            _ => Self {
                id: Uuid::new_v4().to_string(),
                chat_id: default_chat.to_string(),
                content: raw.to_string(),
                timestamp: Utc::now(),
                sender: None,
                format: InboundFormat::PlainText,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> WireMessage {
        WireMessage {
            id: "m-1".to_string(),
            chat_id: "bot_1".to_string(),
            content: "hello".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 11, 28, 12, 0, 0).unwrap(),
            sender: Some("me".to_string()),
        }
    }

    #[test]
    fn test_envelope_uses_camel_case_keys() {
        let json = sample().to_json().unwrap();
        assert!(json.contains("\"chatId\":\"bot_1\""));
        assert!(json.contains("\"timestamp\":\"2025-11-28T12:00:00Z\""));
        assert!(!json.contains("chat_id"));
    }

    #[test]
    fn test_sender_is_optional() {
        let mut msg = sample();
        msg.sender = None;
        let json = msg.to_json().unwrap();
        assert!(!json.contains("sender"));

        let parsed = WireMessage::from_json(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_parse_envelope_routes_to_its_chat() {
        let raw = sample().to_json().unwrap();
        let inbound = InboundMessage::parse(&raw, "default_chat");

        assert_eq!(inbound.format, InboundFormat::Envelope);
        assert_eq!(inbound.chat_id, "bot_1");
        assert_eq!(inbound.id, "m-1");
        assert_eq!(inbound.content, "hello");
    }

    #[test]
    fn test_parse_plain_text_falls_back_to_default_chat() {
        let inbound = InboundMessage::parse("just some text", "default_chat");

        assert_eq!(inbound.format, InboundFormat::PlainText);
        assert_eq!(inbound.chat_id, "default_chat");
        assert_eq!(inbound.content, "just some text");
        assert!(Uuid::parse_str(&inbound.id).is_ok());
    }

    #[test]
    fn test_parse_foreign_json_is_plain_text() {
        let raw = r#"{"type":"presence","user":"bob"}"#;
        let inbound = InboundMessage::parse(raw, "lobby");

        assert_eq!(inbound.format, InboundFormat::PlainText);
        assert_eq!(inbound.chat_id, "lobby");
        assert_eq!(inbound.content, raw);
    }

    #[test]
    fn test_parse_envelope_with_empty_chat_is_plain_text() {
        let mut msg = sample();
        msg.chat_id = String::new();
        let inbound = InboundMessage::parse(&msg.to_json().unwrap(), "default_chat");
        assert_eq!(inbound.chat_id, "default_chat");
    }
}
