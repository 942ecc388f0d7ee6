//! In-memory conversation threads
//!
//! Holds the local record of every message per chat so callers can render
//! history and delivery status. Nothing here is persisted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::delivery::OutboundMessage;
use crate::protocol::InboundMessage;

/// Local status of a message in a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
    Received,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Received => "received",
        }
    }
}

/// One message as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub outgoing: bool,
    pub sender: Option<String>,
    pub status: MessageStatus,
}

impl ChatMessage {
    /// Local record of a message we are sending
    pub fn outgoing(message: &OutboundMessage) -> Self {
        Self {
            id: message.id.clone(),
            content: message.payload.clone(),
            timestamp: message.enqueued_at,
            outgoing: true,
            sender: None,
            status: MessageStatus::Pending,
        }
    }

    /// Local record of a message that arrived
    pub fn incoming(message: &InboundMessage) -> Self {
        Self {
            id: message.id.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            outgoing: false,
            sender: message.sender.clone(),
            status: MessageStatus::Received,
        }
    }
}

/// A chat thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

impl Conversation {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

/// Thread-safe map of conversations keyed by chat id
#[derive(Debug, Default)]
pub struct ConversationStore {
    chats: RwLock<BTreeMap<String, Conversation>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the conversation, creating an empty one if needed
    pub fn create_or_get(&self, chat_id: &str) -> Conversation {
        self.chats
            .write()
            .entry(chat_id.to_string())
            .or_insert_with(|| Conversation::new(chat_id))
            .clone()
    }

    /// Add a message, creating the conversation if needed
    ///
    /// A message whose id is already in the thread is ignored; returns
    /// whether it was added.
    pub fn append(&self, chat_id: &str, message: ChatMessage) -> bool {
        let mut chats = self.chats.write();
        let chat = chats
            .entry(chat_id.to_string())
            .or_insert_with(|| Conversation::new(chat_id));

        if chat.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        chat.messages.push(message);
        true
    }

    /// Update one message's status; returns whether it was found
    pub fn set_status(&self, chat_id: &str, message_id: &str, status: MessageStatus) -> bool {
        let mut chats = self.chats.write();
        let message = chats
            .get_mut(chat_id)
            .and_then(|chat| chat.messages.iter_mut().find(|m| m.id == message_id));

        match message {
            Some(message) => {
                message.status = status;
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn status_of(&self, chat_id: &str, message_id: &str) -> Option<MessageStatus> {
        self.chats
            .read()
            .get(chat_id)?
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.status)
    }

    pub fn get(&self, chat_id: &str) -> Option<Conversation> {
        self.chats.read().get(chat_id).cloned()
    }

    /// All conversations, ordered by id
    pub fn list(&self) -> Vec<Conversation> {
        self.chats.read().values().cloned().collect()
    }

    /// Remove a conversation's messages, keeping the thread
    pub fn clear(&self, chat_id: &str) -> bool {
        match self.chats.write().get_mut(chat_id) {
            Some(chat) => {
                chat.messages.clear();
                true
            }
            None => false,
        }
    }
}
