//! Fanout between broker pub/sub and connection rooms.
//!
//! Every server process publishes live events to broker channels and runs
//! one pattern subscription covering all direct, group and notification
//! channels. Inbound publications are decoded and emitted to the local
//! rooms of the recipients, so connections on any process receive them.
//!
//! Publishing does not wait for receivers. Recipients that are offline at
//! publish time rely on history after reconnecting.

use crate::conversation::{ChannelTarget, Conversation};
use crate::error::ChatError;
use crate::keys;
use crate::rooms::RoomHub;
use metrics::counter;
use parley_broker::{Broker, PatternMessage};
use parley_protocol::events::LiveEvent;
use parley_protocol::{ChatMessage, ConversationKind, LiveMessage, Notification, ServerEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delivered live events, labelled by channel kind.
pub const FANOUT_DELIVERIES: &str = "parley_fanout_deliveries_total";
/// Publications that could not be decoded.
pub const FANOUT_DROPPED: &str = "parley_fanout_dropped_total";

/// Bridges broker channels to connection rooms.
pub struct FanoutGateway {
    broker: Arc<dyn Broker>,
    ready: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

impl FanoutGateway {
    /// Subscribe to all chat channel patterns and start the listener.
    ///
    /// The gateway is ready once this returns.
    ///
    /// # Errors
    ///
    /// Returns a broker error if the subscription cannot be established.
    pub async fn start(broker: Arc<dyn Broker>, rooms: Arc<RoomHub>) -> Result<Self, ChatError> {
        let mut subscription = broker
            .psubscribe(&[
                keys::DM_CHANNEL_PATTERN,
                keys::GROUP_CHANNEL_PATTERN,
                keys::NOTIFY_CHANNEL_PATTERN,
            ])
            .await?;

        let ready = Arc::new(AtomicBool::new(true));
        let listener_ready = ready.clone();
        let listener = tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                let delivered = dispatch(&rooms, &message);
                debug!(channel = %message.channel, delivered, "Fanout");
            }
            listener_ready.store(false, Ordering::Release);
            error!("Fanout subscription ended");
        });

        info!(backend = broker.name(), "Fanout gateway ready");
        Ok(Self {
            broker,
            ready,
            listener,
        })
    }

    /// Whether the subscription is still running.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Publish a stored direct message on its conversation channel.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a message without a recipient, or a
    /// broker error.
    pub async fn publish_direct(&self, message: &ChatMessage) -> Result<(), ChatError> {
        let recipient = message
            .recipient_id
            .as_deref()
            .ok_or_else(|| ChatError::validation("direct message without recipient"))?;
        let channel = Conversation::direct(message.sender_id.as_str(), recipient).channel();
        self.publish(&channel, &LiveMessage::from(message)).await
    }

    /// Publish a stored group message on the group channel.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a message without a group, or a broker
    /// error.
    pub async fn publish_group(&self, message: &ChatMessage) -> Result<(), ChatError> {
        let group_id = message
            .group_id
            .as_deref()
            .ok_or_else(|| ChatError::validation("group message without group"))?;
        let channel = Conversation::group(group_id).channel();
        self.publish(&channel, &LiveMessage::from(message)).await
    }

    /// Publish a notification on a user's notification channel.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn notify(
        &self,
        user_id: &str,
        notification: &Notification,
    ) -> Result<(), ChatError> {
        self.publish(&keys::notify_channel(user_id), notification)
            .await
    }

    async fn publish<T: serde::Serialize>(
        &self,
        channel: &str,
        payload: &T,
    ) -> Result<(), ChatError> {
        let encoded =
            serde_json::to_string(payload).map_err(|e| ChatError::Corrupt(e.to_string()))?;
        let receivers = self.broker.publish(channel, &encoded).await?;
        debug!(channel = %channel, receivers, "Published");
        Ok(())
    }
}

impl Drop for FanoutGateway {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Emit one publication to the local rooms it targets.
///
/// Returns the number of connections the event was queued for.
pub fn dispatch(rooms: &RoomHub, message: &PatternMessage) -> usize {
    let Some(target) = ChannelTarget::parse(&message.channel) else {
        warn!(channel = %message.channel, "Publication on unrecognised channel");
        counter!(FANOUT_DROPPED).increment(1);
        return 0;
    };

    let (label, event) = match decode(&target, message) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(channel = %message.channel, error = %e, "Dropping undecodable publication");
            counter!(FANOUT_DROPPED).increment(1);
            return 0;
        }
    };

    let delivered: usize = target
        .rooms()
        .iter()
        .map(|room| rooms.emit(room, event.clone()))
        .sum();
    counter!(FANOUT_DELIVERIES, "kind" => label).increment(delivered as u64);
    delivered
}

fn decode(
    target: &ChannelTarget,
    message: &PatternMessage,
) -> Result<(&'static str, ServerEvent), serde_json::Error> {
    let event = match target {
        ChannelTarget::Direct(..) => {
            let live: LiveMessage = serde_json::from_str(&message.payload)?;
            (
                ConversationKind::Dm.as_str(),
                ServerEvent::Message(LiveEvent {
                    kind: ConversationKind::Dm,
                    channel: message.channel.clone(),
                    message: live,
                }),
            )
        }
        ChannelTarget::Group(group_id) => {
            let mut live: LiveMessage = serde_json::from_str(&message.payload)?;
            live.group_id = Some(group_id.clone());
            (
                ConversationKind::Group.as_str(),
                ServerEvent::Message(LiveEvent {
                    kind: ConversationKind::Group,
                    channel: message.channel.clone(),
                    message: live,
                }),
            )
        }
        ChannelTarget::Notify(_) => {
            let notification: Notification = serde_json::from_str(&message.payload)?;
            ("notification", ServerEvent::Notification(notification))
        }
    };
    Ok(event)
}
