//! Conversation history on broker logs.
//!
//! The store is the single writer of conversation logs. Each append is one
//! broker log entry whose id is the authoritative order within the
//! conversation; the wall-clock timestamp is carried for display only.

use crate::conversation::Conversation;
use crate::error::ChatError;
use crate::now_ms;
use parley_broker::{Broker, LogEntry, Pipeline, Reply};
use parley_protocol::{ChatMessage, ConversationKind, MessageStatus};
use std::sync::Arc;
use tracing::{debug, warn};

mod fields {
    pub const KIND: &str = "type";
    pub const SENDER: &str = "senderId";
    pub const RECIPIENT: &str = "recipientId";
    pub const GROUP: &str = "groupId";
    pub const MESSAGE: &str = "message";
    pub const TIMESTAMP: &str = "timestamp";
    pub const STATUS: &str = "status";
    pub const METADATA: &str = "metadata";
}

/// Message store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Approximate number of entries retained per conversation. The broker
    /// may keep somewhat more.
    pub log_max_len: usize,
    /// History page size when the client does not ask for one.
    pub history_default_limit: usize,
    /// Largest history page served.
    pub history_max_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            log_max_len: 10_000,
            history_default_limit: 50,
            history_max_limit: 500,
        }
    }
}

/// A message about to be appended.
#[derive(Debug, Clone)]
pub struct Draft {
    pub sender_id: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

impl Draft {
    pub fn new(sender_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            message: message.into(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Append-only conversation history.
pub struct MessageStore {
    broker: Arc<dyn Broker>,
    config: StoreConfig,
}

impl MessageStore {
    pub fn new(broker: Arc<dyn Broker>, config: StoreConfig) -> Self {
        Self { broker, config }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Append a message to a conversation and trim its log.
    ///
    /// Returns the stored message, including its broker-assigned id.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the sender is not a participant of a
    /// direct conversation, or a broker error.
    pub async fn append(
        &self,
        conversation: &Conversation,
        draft: Draft,
    ) -> Result<ChatMessage, ChatError> {
        let (recipient_id, group_id) = match conversation {
            Conversation::Direct { .. } => {
                let recipient = conversation
                    .counterpart(&draft.sender_id)
                    .ok_or_else(|| ChatError::validation("sender is not a participant"))?;
                (Some(recipient.to_string()), None)
            }
            Conversation::Group(group_id) => (None, Some(group_id.clone())),
        };

        let mut message = ChatMessage {
            id: String::new(),
            kind: conversation.kind(),
            sender_id: draft.sender_id,
            recipient_id,
            group_id,
            message: draft.message,
            timestamp: now_ms(),
            status: MessageStatus::Sent,
            metadata: draft.metadata,
        };

        let key = conversation.log_key();
        let mut pipe = Pipeline::new();
        pipe.append(key.as_str(), encode(&message)?)
            .trim(key.as_str(), self.config.log_max_len);

        let mut replies = self.broker.execute(pipe).await?.into_iter();
        message.id = replies
            .next()
            .map(Reply::into_text)
            .transpose()?
            .flatten()
            .ok_or_else(|| ChatError::Corrupt("append returned no id".into()))?;

        debug!(log = %key, id = %message.id, "Message stored");
        Ok(message)
    }

    /// Read up to `limit` of the most recent messages, oldest first.
    ///
    /// The limit is clamped to `1..=history_max_limit`. Entries that cannot
    /// be decoded are skipped.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn history(
        &self,
        conversation: &Conversation,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let limit = limit.clamp(1, self.config.history_max_limit.max(1));
        let key = conversation.log_key();

        let mut pipe = Pipeline::new();
        pipe.rev_range(key.as_str(), limit);
        let entries = self
            .broker
            .execute(pipe)
            .await?
            .pop()
            .map(Reply::into_entries)
            .transpose()?
            .unwrap_or_default();

        let mut messages: Vec<ChatMessage> = entries
            .into_iter()
            .filter_map(|entry| match decode(entry) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(log = %key, error = %e, "Skipping unreadable log entry");
                    None
                }
            })
            .collect();
        messages.reverse();
        Ok(messages)
    }
}

fn encode(message: &ChatMessage) -> Result<Vec<(String, String)>, ChatError> {
    let mut out = vec![
        (fields::KIND.to_string(), message.kind.as_str().to_string()),
        (fields::SENDER.to_string(), message.sender_id.clone()),
        (fields::MESSAGE.to_string(), message.message.clone()),
        (fields::TIMESTAMP.to_string(), message.timestamp.to_string()),
        (fields::STATUS.to_string(), message.status.as_str().to_string()),
    ];
    if let Some(recipient) = &message.recipient_id {
        out.push((fields::RECIPIENT.to_string(), recipient.clone()));
    }
    if let Some(group) = &message.group_id {
        out.push((fields::GROUP.to_string(), group.clone()));
    }
    if let Some(metadata) = &message.metadata {
        let text = serde_json::to_string(metadata)
            .map_err(|e| ChatError::Corrupt(format!("metadata: {}", e)))?;
        out.push((fields::METADATA.to_string(), text));
    }
    Ok(out)
}

fn decode(entry: LogEntry) -> Result<ChatMessage, ChatError> {
    let required = |name: &str| {
        entry
            .get(name)
            .map(str::to_string)
            .ok_or_else(|| ChatError::Corrupt(format!("{} missing from {}", name, entry.id)))
    };

    let kind = ConversationKind::parse(&required(fields::KIND)?)
        .ok_or_else(|| ChatError::Corrupt(format!("bad type in {}", entry.id)))?;
    let timestamp = required(fields::TIMESTAMP)?
        .parse()
        .map_err(|_| ChatError::Corrupt(format!("bad timestamp in {}", entry.id)))?;
    let status = entry
        .get(fields::STATUS)
        .and_then(MessageStatus::parse)
        .unwrap_or(MessageStatus::Sent);
    // Metadata that is not valid JSON is kept as a plain string.
    let metadata = entry.get(fields::METADATA).map(|raw| {
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
    });

    Ok(ChatMessage {
        kind,
        sender_id: required(fields::SENDER)?,
        recipient_id: entry.get(fields::RECIPIENT).map(str::to_string),
        group_id: entry.get(fields::GROUP).map(str::to_string),
        message: required(fields::MESSAGE)?,
        timestamp,
        status,
        metadata,
        id: entry.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_broker::MemoryBroker;
    use serde_json::json;

    fn store_with(broker: Arc<MemoryBroker>, config: StoreConfig) -> MessageStore {
        MessageStore::new(broker, config)
    }

    #[tokio::test]
    async fn test_append_assigns_id_and_participants() {
        let store = store_with(Arc::new(MemoryBroker::new()), StoreConfig::default());
        let conversation = Conversation::direct("alice", "bob");

        let stored = store
            .append(&conversation, Draft::new("bob", "hey"))
            .await
            .unwrap();

        assert!(!stored.id.is_empty());
        assert_eq!(stored.kind, ConversationKind::Dm);
        assert_eq!(stored.sender_id, "bob");
        assert_eq!(stored.recipient_id.as_deref(), Some("alice"));
        assert_eq!(stored.group_id, None);
        assert_eq!(stored.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_append_rejects_outsider() {
        let store = store_with(Arc::new(MemoryBroker::new()), StoreConfig::default());
        let err = store
            .append(&Conversation::direct("alice", "bob"), Draft::new("mallory", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn test_history_is_chronological_from_either_side() {
        let store = store_with(Arc::new(MemoryBroker::new()), StoreConfig::default());

        for i in 0..5 {
            let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
            store
                .append(&Conversation::direct(from, to), Draft::new(from, format!("m{}", i)))
                .await
                .unwrap();
        }

        let history = store
            .history(&Conversation::direct("bob", "alice"), 5)
            .await
            .unwrap();
        let bodies: Vec<_> = history.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3", "m4"]);

        // Most recent page only
        let tail = store
            .history(&Conversation::direct("alice", "bob"), 2)
            .await
            .unwrap();
        let bodies: Vec<_> = tail.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn test_log_length_is_bounded() {
        let broker = Arc::new(MemoryBroker::new());
        let config = StoreConfig {
            log_max_len: 20,
            ..StoreConfig::default()
        };
        let store = store_with(broker.clone(), config);
        let group = Conversation::group("rust");

        for i in 0..100 {
            store
                .append(&group, Draft::new("alice", format!("m{}", i)))
                .await
                .unwrap();
        }

        assert!(broker.log_len(&group.log_key()) < 100);

        // The retained tail is still in append order
        let history = store.history(&group, 10).await.unwrap();
        let expected: Vec<String> = (90..100).map(|i| format!("m{}", i)).collect();
        let bodies: Vec<String> = history.into_iter().map(|m| m.message).collect();
        assert_eq!(bodies, expected);
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let store = store_with(Arc::new(MemoryBroker::new()), StoreConfig::default());
        let group = Conversation::group("rust");

        store
            .append(
                &group,
                Draft::new("alice", "pic").with_metadata(Some(json!({"attachment": "a.png"}))),
            )
            .await
            .unwrap();

        let history = store.history(&group, 50).await.unwrap();
        assert_eq!(history[0].metadata, Some(json!({"attachment": "a.png"})));
        assert_eq!(history[0].group_id.as_deref(), Some("rust"));
    }

    #[tokio::test]
    async fn test_history_limit_is_clamped() {
        let config = StoreConfig {
            history_max_limit: 3,
            ..StoreConfig::default()
        };
        let store = store_with(Arc::new(MemoryBroker::new()), config);
        let group = Conversation::group("g");

        for i in 0..5 {
            store
                .append(&group, Draft::new("alice", format!("m{}", i)))
                .await
                .unwrap();
        }

        assert_eq!(store.history(&group, 100).await.unwrap().len(), 3);
        assert_eq!(store.history(&group, 0).await.unwrap().len(), 1);
        assert!(store
            .history(&Conversation::group("empty"), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_entries_are_skipped() {
        let broker = Arc::new(MemoryBroker::new());
        let store = store_with(broker.clone(), StoreConfig::default());
        let group = Conversation::group("g");

        let mut pipe = Pipeline::new();
        pipe.append(group.log_key(), vec![("junk".into(), "1".into())]);
        broker.execute(pipe).await.unwrap();
        store.append(&group, Draft::new("alice", "ok")).await.unwrap();

        let history = store.history(&group, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "ok");
    }
}
