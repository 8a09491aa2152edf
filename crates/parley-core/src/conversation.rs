//! Conversation identity and channel naming.

use crate::keys;
use parley_protocol::ConversationKind;

/// Order-independent key for the direct conversation between two users.
///
/// Both participants address the same log and channel regardless of who
/// initiates.
#[must_use]
pub fn canonical_pair(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

/// A conversation, either between two users or within a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversation {
    /// Direct conversation. Participant order is irrelevant to identity.
    Direct { a: String, b: String },
    /// Group conversation.
    Group(String),
}

impl Conversation {
    #[must_use]
    pub fn direct(a: impl Into<String>, b: impl Into<String>) -> Self {
        Conversation::Direct {
            a: a.into(),
            b: b.into(),
        }
    }

    #[must_use]
    pub fn group(group_id: impl Into<String>) -> Self {
        Conversation::Group(group_id.into())
    }

    #[must_use]
    pub fn kind(&self) -> ConversationKind {
        match self {
            Conversation::Direct { .. } => ConversationKind::Dm,
            Conversation::Group(_) => ConversationKind::Group,
        }
    }

    /// Canonical identity: the sorted pair for direct, the group id otherwise.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Conversation::Direct { a, b } => canonical_pair(a, b),
            Conversation::Group(group_id) => group_id.clone(),
        }
    }

    /// Log key holding this conversation's history.
    #[must_use]
    pub fn log_key(&self) -> String {
        match self {
            Conversation::Direct { .. } => keys::dm_log(&self.id()),
            Conversation::Group(group_id) => keys::group_log(group_id),
        }
    }

    /// Pub/sub channel for live delivery.
    #[must_use]
    pub fn channel(&self) -> String {
        match self {
            Conversation::Direct { .. } => keys::dm_channel(&self.id()),
            Conversation::Group(group_id) => keys::group_channel(group_id),
        }
    }

    /// The other participant of a direct conversation.
    ///
    /// Returns `None` for groups or if `user_id` is not a participant.
    #[must_use]
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        match self {
            Conversation::Direct { a, b } if a == user_id => Some(b.as_str()),
            Conversation::Direct { a, b } if b == user_id => Some(a.as_str()),
            _ => None,
        }
    }
}

/// Destination decoded from a published channel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTarget {
    /// Direct channel, carrying both participants.
    Direct(String, String),
    /// Group channel.
    Group(String),
    /// Per-user notification channel.
    Notify(String),
}

impl ChannelTarget {
    /// Decode a channel name.
    ///
    /// Identifiers never contain `:`, so a direct channel splits into exactly
    /// two participants.
    #[must_use]
    pub fn parse(channel: &str) -> Option<Self> {
        if let Some(pair) = channel.strip_prefix(keys::DM_CHANNEL_PREFIX) {
            let (a, b) = pair.split_once(':')?;
            if a.is_empty() || b.is_empty() || b.contains(':') {
                return None;
            }
            return Some(ChannelTarget::Direct(a.to_string(), b.to_string()));
        }
        if let Some(group_id) = channel.strip_prefix(keys::GROUP_CHANNEL_PREFIX) {
            return single(group_id).map(ChannelTarget::Group);
        }
        if let Some(user_id) = channel.strip_prefix(keys::NOTIFY_CHANNEL_PREFIX) {
            return single(user_id).map(ChannelTarget::Notify);
        }
        None
    }

    /// Connection-layer rooms that should receive an event on this channel.
    #[must_use]
    pub fn rooms(&self) -> Vec<String> {
        match self {
            ChannelTarget::Direct(a, b) => vec![keys::user_room(a), keys::user_room(b)],
            ChannelTarget::Group(group_id) => vec![keys::group_room(group_id)],
            ChannelTarget::Notify(user_id) => vec![keys::user_room(user_id)],
        }
    }
}

fn single(segment: &str) -> Option<String> {
    if segment.is_empty() || segment.contains(':') {
        None
    } else {
        Some(segment.to_string())
    }
}
