//! Outbound message record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::WireMessage;

/// A message the caller asked to send
///
/// Immutable once created apart from `delivery_attempts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Unique id, reused for every retry
    pub id: String,

    /// Message text
    pub payload: String,

    /// Target conversation
    pub chat_id: String,

    /// When the message was created
    pub enqueued_at: DateTime<Utc>,

    /// Failed transmissions so far
    #[serde(default)]
    pub delivery_attempts: u32,
}

impl OutboundMessage {
    pub fn new(chat_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload: payload.into(),
            chat_id: chat_id.into(),
            enqueued_at: Utc::now(),
            delivery_attempts: 0,
        }
    }

    /// Wire envelope for this message
    pub fn to_wire(&self, sender: Option<&str>) -> WireMessage {
        WireMessage {
            id: self.id.clone(),
            chat_id: self.chat_id.clone(),
            content: self.payload.clone(),
            timestamp: self.enqueued_at,
            sender: sender.map(str::to_string),
        }
    }
}
