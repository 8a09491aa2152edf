//! Composition root for the messaging services.
//!
//! One [`Engine`] exists per process. It owns the broker handle, the room
//! hub and every service, and is shared by reference with each session.

use crate::conversation::Conversation;
use crate::delivery::DeliveryTracker;
use crate::error::ChatError;
use crate::fanout::FanoutGateway;
use crate::groups::GroupMembership;
use crate::now_ms;
use crate::presence::PresenceTracker;
use crate::rooms::{RoomConfig, RoomHub};
use crate::store::{Draft, MessageStore, StoreConfig};
use parley_broker::Broker;
use parley_protocol::{ChatMessage, Notification};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub rooms: RoomConfig,
    /// TTL on presence markers and session sets.
    pub presence_ttl: Duration,
    /// Retention of delivery receipts and pending entries.
    pub delivery_retention: Duration,
    /// Largest accepted message body in bytes.
    pub max_message_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            rooms: RoomConfig::default(),
            presence_ttl: Duration::from_secs(3600),
            delivery_retention: Duration::from_secs(86_400),
            max_message_size: 64 * 1024,
        }
    }
}

/// Shared messaging services.
pub struct Engine {
    broker: Arc<dyn Broker>,
    rooms: Arc<RoomHub>,
    store: MessageStore,
    fanout: FanoutGateway,
    presence: PresenceTracker,
    delivery: DeliveryTracker,
    groups: GroupMembership,
    config: EngineConfig,
}

impl Engine {
    /// Build the services and start the fanout subscription.
    ///
    /// # Errors
    ///
    /// Returns a broker error if the fanout subscription fails.
    pub async fn start(
        broker: Arc<dyn Broker>,
        config: EngineConfig,
    ) -> Result<Arc<Self>, ChatError> {
        let rooms = Arc::new(RoomHub::with_config(config.rooms.clone()));
        let fanout = FanoutGateway::start(broker.clone(), rooms.clone()).await?;

        let engine = Self {
            store: MessageStore::new(broker.clone(), config.store.clone()),
            presence: PresenceTracker::new(broker.clone(), config.presence_ttl),
            delivery: DeliveryTracker::new(broker.clone(), config.delivery_retention),
            groups: GroupMembership::new(broker.clone()),
            broker,
            rooms,
            fanout,
            config,
        };

        info!(backend = engine.broker.name(), "Messaging engine started");
        Ok(Arc::new(engine))
    }

    /// Persist, publish and notify for a direct message.
    ///
    /// A failed notification is logged; the message is already delivered
    /// through the conversation channel and history.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be stored or published.
    pub async fn send_direct(
        &self,
        sender_id: &str,
        recipient_id: &str,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<ChatMessage, ChatError> {
        let conversation = Conversation::direct(sender_id, recipient_id);
        let stored = self
            .store
            .append(&conversation, Draft::new(sender_id, message).with_metadata(metadata))
            .await?;
        self.fanout.publish_direct(&stored).await?;

        let notification = Notification {
            kind: "new_message".to_string(),
            title: "New Message".to_string(),
            message: "You have a new message".to_string(),
            data: Some(serde_json::json!({
                "senderId": sender_id,
                "message": message,
            })),
            timestamp: now_ms(),
        };
        if let Err(e) = self.fanout.notify(recipient_id, &notification).await {
            warn!(user = %recipient_id, error = %e, "Failed to publish notification");
        }

        debug!(from = %sender_id, to = %recipient_id, id = %stored.id, "Direct message sent");
        Ok(stored)
    }

    /// Persist and publish a group message, then record it as pending for
    /// every other member.
    ///
    /// Pending bookkeeping is best-effort per member.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be stored or published.
    pub async fn send_group(
        &self,
        sender_id: &str,
        group_id: &str,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<ChatMessage, ChatError> {
        let conversation = Conversation::group(group_id);
        let stored = self
            .store
            .append(&conversation, Draft::new(sender_id, message).with_metadata(metadata))
            .await?;
        self.fanout.publish_group(&stored).await?;

        match self.groups.members(group_id).await {
            Ok(members) => {
                for member in members.iter().filter(|m| m.as_str() != sender_id) {
                    if let Err(e) = self
                        .delivery
                        .track_pending(member, &stored.id, sender_id, group_id)
                        .await
                    {
                        warn!(
                            user = %member,
                            message = %stored.id,
                            error = %e,
                            "Failed to track pending delivery"
                        );
                    }
                }
            }
            Err(e) => {
                warn!(group = %group_id, error = %e, "Failed to load members for pending tracking");
            }
        }

        debug!(from = %sender_id, group = %group_id, id = %stored.id, "Group message sent");
        Ok(stored)
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomHub> {
        &self.rooms
    }

    #[must_use]
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    #[must_use]
    pub fn fanout(&self) -> &FanoutGateway {
        &self.fanout
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    #[must_use]
    pub fn delivery(&self) -> &DeliveryTracker {
        &self.delivery
    }

    #[must_use]
    pub fn groups(&self) -> &GroupMembership {
        &self.groups
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
