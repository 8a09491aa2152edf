//! Delivery and read receipts.
//!
//! Receipts are best-effort: every record is written with a retention
//! window and may expire. A missing record means "unknown", not "never
//! delivered".

use crate::error::ChatError;
use crate::keys;
use crate::now_ms;
use parley_broker::{Broker, BrokerExt, Pipeline, Reply};
use parley_protocol::{ConversationKind, DeliveryState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A message recorded as awaiting acknowledgement by one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDelivery {
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub message_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub timestamp: u64,
    pub status: String,
}

/// Per-recipient delivery state.
pub struct DeliveryTracker {
    broker: Arc<dyn Broker>,
    retention: Duration,
}

impl DeliveryTracker {
    pub fn new(broker: Arc<dyn Broker>, retention: Duration) -> Self {
        Self { broker, retention }
    }

    /// Record a group message as pending for `recipient_id`.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn track_pending(
        &self,
        recipient_id: &str,
        message_id: &str,
        sender_id: &str,
        group_id: &str,
    ) -> Result<(), ChatError> {
        let entry = PendingDelivery {
            kind: ConversationKind::Group,
            message_id: message_id.to_string(),
            sender_id: sender_id.to_string(),
            group_id: Some(group_id.to_string()),
            timestamp: now_ms(),
            status: "pending".to_string(),
        };
        let encoded =
            serde_json::to_string(&entry).map_err(|e| ChatError::Corrupt(e.to_string()))?;

        let key = keys::pending(recipient_id);
        let mut pipe = Pipeline::new();
        pipe.sadd(key.as_str(), encoded)
            .expire(key.as_str(), self.retention);
        self.broker.execute(pipe).await?;

        debug!(user = %recipient_id, message = %message_id, "Tracking pending delivery");
        Ok(())
    }

    /// Pending entries for a user. Unreadable entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn pending(&self, user_id: &str) -> Result<Vec<PendingDelivery>, ChatError> {
        let raw = self.broker.members(&keys::pending(user_id)).await?;
        Ok(raw
            .iter()
            .filter_map(|member| serde_json::from_str(member).ok())
            .collect())
    }

    /// Mark a message delivered to `user_id`.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn mark_delivered(&self, user_id: &str, message_id: &str) -> Result<(), ChatError> {
        self.acknowledge(user_id, message_id, keys::delivered(message_id, user_id))
            .await?;
        debug!(user = %user_id, message = %message_id, "Marked delivered");
        Ok(())
    }

    /// Mark a message read by `user_id`. Independent of the delivered flag.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn mark_read(&self, user_id: &str, message_id: &str) -> Result<(), ChatError> {
        self.acknowledge(user_id, message_id, keys::read(message_id, user_id))
            .await?;
        debug!(user = %user_id, message = %message_id, "Marked read");
        Ok(())
    }

    async fn acknowledge(
        &self,
        user_id: &str,
        message_id: &str,
        flag: String,
    ) -> Result<(), ChatError> {
        let pending_key = keys::pending(user_id);
        let matching: Vec<String> = self
            .broker
            .members(&pending_key)
            .await?
            .into_iter()
            .filter(|member| {
                match serde_json::from_str::<PendingDelivery>(member) {
                    Ok(entry) => entry.message_id == message_id,
                    Err(_) => {
                        warn!(user = %user_id, "Unreadable pending entry");
                        false
                    }
                }
            })
            .collect();

        let mut pipe = Pipeline::new();
        for member in matching {
            pipe.srem(pending_key.as_str(), member);
        }
        pipe.set_ex(flag, "true", self.retention);
        self.broker.execute(pipe).await?;
        Ok(())
    }

    /// Delivered/read flags for many recipients in one round trip.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn delivery_status(
        &self,
        message_id: &str,
        recipient_ids: &[String],
    ) -> Result<BTreeMap<String, DeliveryState>, ChatError> {
        if recipient_ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut pipe = Pipeline::new();
        for user_id in recipient_ids {
            pipe.exists(keys::delivered(message_id, user_id))
                .exists(keys::read(message_id, user_id));
        }
        let flags = self
            .broker
            .execute(pipe)
            .await?
            .into_iter()
            .map(Reply::into_bool)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(recipient_ids
            .iter()
            .cloned()
            .zip(flags.chunks(2).map(|pair| DeliveryState {
                delivered: pair.first().copied().unwrap_or(false),
                read: pair.get(1).copied().unwrap_or(false),
            }))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_broker::MemoryBroker;

    fn tracker() -> DeliveryTracker {
        DeliveryTracker::new(Arc::new(MemoryBroker::new()), Duration::from_secs(86_400))
    }

    #[tokio::test]
    async fn test_delivered_then_read() {
        let delivery = tracker();
        let bob = vec!["bob".to_string()];

        delivery.mark_delivered("bob", "1-0").await.unwrap();
        let status = delivery.delivery_status("1-0", &bob).await.unwrap();
        assert_eq!(
            status["bob"],
            DeliveryState {
                delivered: true,
                read: false
            }
        );

        delivery.mark_read("bob", "1-0").await.unwrap();
        let status = delivery.delivery_status("1-0", &bob).await.unwrap();
        assert_eq!(
            status["bob"],
            DeliveryState {
                delivered: true,
                read: true
            }
        );
    }

    #[tokio::test]
    async fn test_status_is_per_recipient() {
        let delivery = tracker();
        delivery.mark_read("carol", "7-0").await.unwrap();

        let status = delivery
            .delivery_status("7-0", &["bob".to_string(), "carol".to_string()])
            .await
            .unwrap();
        assert_eq!(status["bob"], DeliveryState::default());
        assert_eq!(
            status["carol"],
            DeliveryState {
                delivered: false,
                read: true
            }
        );
        assert!(delivery.delivery_status("7-0", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_cleared_by_ack() {
        let delivery = tracker();
        delivery.track_pending("bob", "1-0", "alice", "g").await.unwrap();
        delivery.track_pending("bob", "2-0", "alice", "g").await.unwrap();

        let pending = delivery.pending("bob").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending
            .iter()
            .all(|p| p.kind == ConversationKind::Group && p.sender_id == "alice"));

        delivery.mark_delivered("bob", "1-0").await.unwrap();
        let pending = delivery.pending("bob").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, "2-0");

        // Acknowledging something never tracked only sets the flag
        delivery.mark_read("bob", "9-0").await.unwrap();
        assert_eq!(delivery.pending("bob").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipts_expire() {
        let delivery = DeliveryTracker::new(Arc::new(MemoryBroker::new()), Duration::from_secs(60));
        delivery.mark_delivered("bob", "1-0").await.unwrap();
        delivery.track_pending("bob", "2-0", "alice", "g").await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        let status = delivery
            .delivery_status("1-0", &["bob".to_string()])
            .await
            .unwrap();
        assert!(!status["bob"].delivered);
        assert!(delivery.pending("bob").await.unwrap().is_empty());
    }
}
