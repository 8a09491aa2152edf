//! Inbound and outbound connection events.
//!
//! Clients exchange envelopes of the form `{"event": "<name>", "data": {...}}`.
//! Inbound envelopes are resolved into a [`ClientEvent`] variant with a
//! strict payload schema. Missing string fields decode as empty strings so the
//! session can report exactly which field is required.

use crate::codec::ProtocolError;
use crate::types::{ChatMessage, ConversationKind, DeliveryState, LiveMessage, Notification};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Event names.
pub mod names {
    pub const SEND_DM: &str = "chat:send-dm";
    pub const GET_DM_HISTORY: &str = "chat:get-dm-history";
    pub const JOIN_GROUP: &str = "chat:join-group";
    pub const LEAVE_GROUP: &str = "chat:leave-group";
    pub const SEND_GROUP: &str = "chat:send-group";
    pub const GET_GROUP_HISTORY: &str = "chat:get-group-history";
    pub const TYPING_DM: &str = "chat:typing-dm";
    pub const TYPING_GROUP: &str = "chat:typing-group";
    pub const MARK_DELIVERED: &str = "chat:mark-delivered";
    pub const MARK_READ: &str = "chat:mark-read";
    pub const GET_DELIVERY_STATUS: &str = "chat:get-delivery-status";
    pub const CHECK_ONLINE: &str = "chat:check-online";
    pub const GET_ONLINE_USERS: &str = "chat:get-online-users";
    pub const PING: &str = "ping";
}

/// Raw event envelope, before payload validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Create an envelope from a name and a serializable payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn new(event: impl Into<String>, data: &impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_value(data)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SendDirect {
    pub recipient_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DirectHistoryQuery {
    pub other_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GroupRef {
    pub group_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SendGroup {
    pub group_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GroupHistoryQuery {
    pub group_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TypingDirect {
    pub recipient_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TypingGroup {
    pub group_id: String,
    pub is_typing: bool,
}

/// Acknowledgement of a single message by the acting user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageAck {
    pub message_id: String,
    /// Accepted for compatibility; receipts are keyed by message id alone.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ConversationKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeliveryQuery {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CheckOnline {
    pub user_id: String,
}

/// An inbound client event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SendDirect(SendDirect),
    GetDirectHistory(DirectHistoryQuery),
    JoinGroup(GroupRef),
    LeaveGroup(GroupRef),
    SendGroup(SendGroup),
    GetGroupHistory(GroupHistoryQuery),
    TypingDirect(TypingDirect),
    TypingGroup(TypingGroup),
    MarkDelivered(MessageAck),
    MarkRead(MessageAck),
    GetDeliveryStatus(DeliveryQuery),
    CheckOnline(CheckOnline),
    GetOnlineUsers,
    Ping,
}

fn payload<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, ProtocolError> {
    let data = if data.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}

impl ClientEvent {
    /// Resolve an envelope into a typed event.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown event names or payloads whose fields have
    /// the wrong type.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { event, data } = envelope;
        let parsed = match event.as_str() {
            names::SEND_DM => ClientEvent::SendDirect(payload(data)?),
            names::GET_DM_HISTORY => ClientEvent::GetDirectHistory(payload(data)?),
            names::JOIN_GROUP => ClientEvent::JoinGroup(payload(data)?),
            names::LEAVE_GROUP => ClientEvent::LeaveGroup(payload(data)?),
            names::SEND_GROUP => ClientEvent::SendGroup(payload(data)?),
            names::GET_GROUP_HISTORY => ClientEvent::GetGroupHistory(payload(data)?),
            names::TYPING_DM => ClientEvent::TypingDirect(payload(data)?),
            names::TYPING_GROUP => ClientEvent::TypingGroup(payload(data)?),
            names::MARK_DELIVERED => ClientEvent::MarkDelivered(payload(data)?),
            names::MARK_READ => ClientEvent::MarkRead(payload(data)?),
            names::GET_DELIVERY_STATUS => ClientEvent::GetDeliveryStatus(payload(data)?),
            names::CHECK_ONLINE => ClientEvent::CheckOnline(payload(data)?),
            names::GET_ONLINE_USERS => ClientEvent::GetOnlineUsers,
            names::PING => ClientEvent::Ping,
            _ => return Err(ProtocolError::UnknownEvent(event)),
        };
        Ok(parsed)
    }

    /// Turn the event back into an envelope (used by clients and tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn into_envelope(self) -> Result<Envelope, ProtocolError> {
        let name = self.name();
        let data = match self {
            ClientEvent::SendDirect(p) => serde_json::to_value(p)?,
            ClientEvent::GetDirectHistory(p) => serde_json::to_value(p)?,
            ClientEvent::JoinGroup(p) | ClientEvent::LeaveGroup(p) => serde_json::to_value(p)?,
            ClientEvent::SendGroup(p) => serde_json::to_value(p)?,
            ClientEvent::GetGroupHistory(p) => serde_json::to_value(p)?,
            ClientEvent::TypingDirect(p) => serde_json::to_value(p)?,
            ClientEvent::TypingGroup(p) => serde_json::to_value(p)?,
            ClientEvent::MarkDelivered(p) | ClientEvent::MarkRead(p) => serde_json::to_value(p)?,
            ClientEvent::GetDeliveryStatus(p) => serde_json::to_value(p)?,
            ClientEvent::CheckOnline(p) => serde_json::to_value(p)?,
            ClientEvent::GetOnlineUsers | ClientEvent::Ping => serde_json::Value::Null,
        };
        Ok(Envelope {
            event: name.to_string(),
            data,
        })
    }

    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendDirect(_) => names::SEND_DM,
            ClientEvent::GetDirectHistory(_) => names::GET_DM_HISTORY,
            ClientEvent::JoinGroup(_) => names::JOIN_GROUP,
            ClientEvent::LeaveGroup(_) => names::LEAVE_GROUP,
            ClientEvent::SendGroup(_) => names::SEND_GROUP,
            ClientEvent::GetGroupHistory(_) => names::GET_GROUP_HISTORY,
            ClientEvent::TypingDirect(_) => names::TYPING_DM,
            ClientEvent::TypingGroup(_) => names::TYPING_GROUP,
            ClientEvent::MarkDelivered(_) => names::MARK_DELIVERED,
            ClientEvent::MarkRead(_) => names::MARK_READ,
            ClientEvent::GetDeliveryStatus(_) => names::GET_DELIVERY_STATUS,
            ClientEvent::CheckOnline(_) => names::CHECK_ONLINE,
            ClientEvent::GetOnlineUsers => names::GET_ONLINE_USERS,
            ClientEvent::Ping => names::PING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentAck {
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub message: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectHistory {
    pub other_user_id: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupHistory {
    pub group_id: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipChange {
    pub group_id: String,
    pub user_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub is_typing: bool,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatus {
    pub message_id: String,
    pub status: BTreeMap<String, DeliveryState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineStatus {
    pub user_id: String,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineUsers {
    pub users: Vec<String>,
}

/// A live message as delivered to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    /// Broker channel the message arrived on.
    pub channel: String,
    #[serde(flatten)]
    pub message: LiveMessage,
}

/// Error category reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed frame or unknown event.
    BadRequest,
    /// Missing or invalid payload field.
    Validation,
    /// Acting on a resource the connection has not joined.
    Forbidden,
    /// Broker timeout or outage.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: ErrorCode,
}

/// An outbound server event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "chat:sent")]
    Sent(SentAck),
    #[serde(rename = "chat:dm-history")]
    DirectHistory(DirectHistory),
    #[serde(rename = "chat:group-history")]
    GroupHistory(GroupHistory),
    #[serde(rename = "chat:joined-group")]
    JoinedGroup(GroupRef),
    #[serde(rename = "chat:left-group")]
    LeftGroup(GroupRef),
    #[serde(rename = "chat:user-joined")]
    UserJoined(MembershipChange),
    #[serde(rename = "chat:user-left")]
    UserLeft(MembershipChange),
    #[serde(rename = "chat:typing")]
    Typing(Typing),
    #[serde(rename = "chat:delivered")]
    Delivered(MessageRef),
    #[serde(rename = "chat:read")]
    Read(MessageRef),
    #[serde(rename = "chat:delivery-status")]
    DeliveryStatus(DeliveryStatus),
    #[serde(rename = "chat:online-status")]
    OnlineStatus(OnlineStatus),
    #[serde(rename = "chat:online-users")]
    OnlineUsers(OnlineUsers),
    #[serde(rename = "chat:message")]
    Message(LiveEvent),
    #[serde(rename = "notification")]
    Notification(Notification),
    #[serde(rename = "pong")]
    Pong {},
    #[serde(rename = "chat:error")]
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Create an error event.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            message: message.into(),
            code,
        })
    }

    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Sent(_) => "chat:sent",
            ServerEvent::DirectHistory(_) => "chat:dm-history",
            ServerEvent::GroupHistory(_) => "chat:group-history",
            ServerEvent::JoinedGroup(_) => "chat:joined-group",
            ServerEvent::LeftGroup(_) => "chat:left-group",
            ServerEvent::UserJoined(_) => "chat:user-joined",
            ServerEvent::UserLeft(_) => "chat:user-left",
            ServerEvent::Typing(_) => "chat:typing",
            ServerEvent::Delivered(_) => "chat:delivered",
            ServerEvent::Read(_) => "chat:read",
            ServerEvent::DeliveryStatus(_) => "chat:delivery-status",
            ServerEvent::OnlineStatus(_) => "chat:online-status",
            ServerEvent::OnlineUsers(_) => "chat:online-users",
            ServerEvent::Message(_) => "chat:message",
            ServerEvent::Notification(_) => "notification",
            ServerEvent::Pong {} => "pong",
            ServerEvent::Error(_) => "chat:error",
        }
    }
}
