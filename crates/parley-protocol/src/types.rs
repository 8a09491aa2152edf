//! Data types shared by the wire protocol and the messaging core.

use serde::{Deserialize, Serialize};

/// Maximum identifier length in bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate a user, group or message identifier.
///
/// Identifiers end up embedded in broker keys and channel names, which are
/// split on `:`, so the separator is not allowed inside them.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_identifier(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err("identifier cannot be empty");
    }
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err("identifier too long");
    }
    if value.contains(':') {
        return Err("identifier cannot contain ':'");
    }
    if !value.chars().all(|c| c.is_ascii_graphic()) {
        return Err("identifier contains invalid characters");
    }
    Ok(())
}

/// Kind of conversation a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// One-to-one conversation.
    Dm,
    /// Group conversation.
    Group,
}

impl ConversationKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Dm => "dm",
            ConversationKind::Group => "group",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dm" => Some(ConversationKind::Dm),
            "group" => Some(ConversationKind::Group),
            _ => None,
        }
    }
}

/// Status recorded with a stored message.
///
/// Logs are append-only, so a stored message always carries the status it
/// was written with. Per-recipient progress lives in delivery receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            _ => None,
        }
    }
}

/// A message as persisted in a conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Broker-assigned log entry id, monotonic within its conversation.
    pub id: String,
    /// Conversation kind.
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    /// Sender user id.
    pub sender_id: String,
    /// Recipient user id (direct messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    /// Group id (group messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Message body.
    pub message: String,
    /// Wall-clock send time in milliseconds. Display only.
    pub timestamp: u64,
    /// Status at write time.
    pub status: MessageStatus,
    /// Optional client-supplied metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A message as published for live delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMessage {
    pub message_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub message: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl From<&ChatMessage> for LiveMessage {
    fn from(stored: &ChatMessage) -> Self {
        Self {
            message_id: stored.id.clone(),
            sender_id: stored.sender_id.clone(),
            recipient_id: stored.recipient_id.clone(),
            group_id: stored.group_id.clone(),
            message: stored.message.clone(),
            timestamp: stored.timestamp,
            metadata: stored.metadata.clone(),
        }
    }
}

/// A user-targeted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification type, e.g. `new_message`.
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Publish time in milliseconds.
    pub timestamp: u64,
}

/// Delivery and read flags for one recipient of one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryState {
    pub delivered: bool,
    pub read: bool,
}
