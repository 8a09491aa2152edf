//! # parley-core
//!
//! Messaging and presence services for the Parley realtime engine.
//!
//! - **MessageStore** - append-only conversation history over broker logs
//! - **FanoutGateway** - bridges broker pub/sub to connection rooms
//! - **PresenceTracker** - multi-device online state with TTL expiry
//! - **DeliveryTracker** - per-recipient delivered/read receipts
//! - **Session** - per-connection event dispatch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Engine    │────▶│   Broker    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                                       │
//!        │            ┌─────────────┐            │
//!        └────────────│   RoomHub   │◀───────────┘
//!                     └─────────────┘  FanoutGateway
//! ```

pub mod conversation;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod groups;
pub mod keys;
pub mod presence;
pub mod rooms;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use conversation::{canonical_pair, ChannelTarget, Conversation};
pub use delivery::{DeliveryTracker, PendingDelivery};
pub use engine::{Engine, EngineConfig};
pub use error::{ChatError, ErrorKind};
pub use fanout::FanoutGateway;
pub use groups::GroupMembership;
pub use presence::{PresenceTracker, PresenceTransition};
pub use rooms::{RoomConfig, RoomError, RoomEvent, RoomHub, RoomStats};
pub use session::Session;
pub use store::{Draft, MessageStore, StoreConfig};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
