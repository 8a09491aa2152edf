//! Connection-layer rooms.
//!
//! A room is a named multicast group of connections. Connections join and
//! leave explicitly; each joined room yields a broadcast receiver that the
//! connection forwards to its socket. Emitting never blocks: a connection
//! that falls behind misses events rather than stalling the emitter.

use dashmap::{DashMap, DashSet};
use parley_protocol::ServerEvent;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Already a member of the room.
    #[error("Already joined room: {0}")]
    AlreadyJoined(String),

    /// Not a member of the room.
    #[error("Not joined to room: {0}")]
    NotJoined(String),

    /// Per-connection room limit reached.
    #[error("Maximum rooms per connection reached")]
    MaxRoomsReached,
}

/// Room hub configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum rooms one connection may join.
    pub max_rooms_per_connection: usize,
    /// Broadcast buffer per room.
    pub room_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: 100,
            room_capacity: 1024,
        }
    }
}

/// An event multicast to a room.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    /// Connection that caused the event, if it should not receive it.
    pub origin: Option<String>,
    pub event: ServerEvent,
}

impl RoomEvent {
    /// Whether the event should be delivered to `connection_id`.
    #[must_use]
    pub fn is_for(&self, connection_id: &str) -> bool {
        self.origin.as_deref() != Some(connection_id)
    }
}

struct Room {
    sender: broadcast::Sender<Arc<RoomEvent>>,
    members: HashSet<String>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: HashSet::new(),
        }
    }
}

/// In-process room registry.
pub struct RoomHub {
    rooms: DashMap<String, Room>,
    /// connection id -> joined room names
    connections: DashMap<String, DashSet<String>>,
    config: RoomConfig,
}

impl RoomHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RoomConfig::default())
    }

    #[must_use]
    pub fn with_config(config: RoomConfig) -> Self {
        info!("Creating room hub with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            connections: DashMap::new(),
            config,
        }
    }

    /// Join a connection to a room, creating the room if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if already joined or the per-connection limit is hit.
    pub fn join(
        &self,
        connection_id: &str,
        room: &str,
    ) -> Result<broadcast::Receiver<Arc<RoomEvent>>, RoomError> {
        let joined = self
            .connections
            .entry(connection_id.to_string())
            .or_default();

        if joined.contains(room) {
            return Err(RoomError::AlreadyJoined(room.to_string()));
        }
        if joined.len() >= self.config.max_rooms_per_connection {
            return Err(RoomError::MaxRoomsReached);
        }

        let mut entry = self
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| Room::new(self.config.room_capacity));
        entry.members.insert(connection_id.to_string());
        let receiver = entry.sender.subscribe();
        joined.insert(room.to_string());

        debug!(
            room = %room,
            connection = %connection_id,
            members = entry.members.len(),
            "Joined room"
        );

        Ok(receiver)
    }

    /// Remove a connection from a room. Empty rooms are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection had not joined the room.
    pub fn leave(&self, connection_id: &str, room: &str) -> Result<(), RoomError> {
        let removed = self
            .connections
            .get(connection_id)
            .and_then(|joined| joined.remove(room))
            .is_some();
        if !removed {
            return Err(RoomError::NotJoined(room.to_string()));
        }

        self.detach(connection_id, room);
        debug!(room = %room, connection = %connection_id, "Left room");
        Ok(())
    }

    /// Remove a connection from every room it joined.
    pub fn leave_all(&self, connection_id: &str) {
        if let Some((_, joined)) = self.connections.remove(connection_id) {
            for room in joined.iter() {
                self.detach(connection_id, room.as_str());
            }
        }
        debug!(connection = %connection_id, "Left all rooms");
    }

    fn detach(&self, connection_id: &str, room: &str) {
        let now_empty = match self.rooms.get_mut(room) {
            Some(mut entry) => {
                entry.members.remove(connection_id);
                entry.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.rooms.remove_if(room, |_, entry| entry.members.is_empty());
            trace!(room = %room, "Dropped empty room");
        }
    }

    /// Emit an event to every connection in a room.
    ///
    /// Returns the number of connections it was queued for.
    pub fn emit(&self, room: &str, event: ServerEvent) -> usize {
        self.send(room, RoomEvent {
            origin: None,
            event,
        })
    }

    /// Emit an event to every connection in a room except `origin`.
    pub fn emit_from(&self, room: &str, origin: &str, event: ServerEvent) -> usize {
        let excluded = usize::from(self.is_joined(origin, room));
        self.send(room, RoomEvent {
            origin: Some(origin.to_string()),
            event,
        })
        .saturating_sub(excluded)
    }

    fn send(&self, room: &str, event: RoomEvent) -> usize {
        match self.rooms.get(room) {
            Some(entry) => {
                let count = entry.sender.send(Arc::new(event)).unwrap_or_default();
                trace!(room = %room, recipients = count, "Emitted");
                count
            }
            None => 0,
        }
    }

    #[must_use]
    pub fn is_joined(&self, connection_id: &str, room: &str) -> bool {
        self.connections
            .get(connection_id)
            .map(|joined| joined.contains(room))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms
            .get(room)
            .map(|entry| entry.members.len())
            .unwrap_or(0)
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn connection_rooms(&self, connection_id: &str) -> Vec<String> {
        self.connections
            .get(connection_id)
            .map(|joined| joined.iter().map(|r| r.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            room_count: self.rooms.len(),
            connection_count: self.connections.len(),
            total_memberships: self.connections.iter().map(|j| j.len()).sum(),
        }
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Room hub statistics.
#[derive(Debug, Clone)]
pub struct RoomStats {
    pub room_count: usize,
    pub connection_count: usize,
    pub total_memberships: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong() -> ServerEvent {
        ServerEvent::Pong {}
    }

    #[test]
    fn test_join_and_leave() {
        let hub = RoomHub::new();

        let _rx = hub.join("c1", "group:rust").unwrap();
        assert!(hub.is_joined("c1", "group:rust"));
        assert_eq!(hub.member_count("group:rust"), 1);

        assert!(matches!(
            hub.join("c1", "group:rust"),
            Err(RoomError::AlreadyJoined(_))
        ));

        hub.leave("c1", "group:rust").unwrap();
        assert!(!hub.is_joined("c1", "group:rust"));
        assert_eq!(hub.stats().room_count, 0);

        assert!(matches!(
            hub.leave("c1", "group:rust"),
            Err(RoomError::NotJoined(_))
        ));
    }

    #[test]
    fn test_emit_reaches_all_members() {
        let hub = RoomHub::new();
        let mut rx1 = hub.join("c1", "user:bob").unwrap();
        let mut rx2 = hub.join("c2", "user:bob").unwrap();

        assert_eq!(hub.emit("user:bob", pong()), 2);
        assert!(rx1.try_recv().unwrap().is_for("c1"));
        assert!(rx2.try_recv().unwrap().is_for("c2"));

        assert_eq!(hub.emit("user:nobody", pong()), 0);
    }

    #[test]
    fn test_emit_from_excludes_origin() {
        let hub = RoomHub::new();
        let mut rx1 = hub.join("c1", "group:g").unwrap();
        let mut rx2 = hub.join("c2", "group:g").unwrap();

        assert_eq!(hub.emit_from("group:g", "c1", pong()), 1);

        let seen_by_origin = rx1.try_recv().unwrap();
        assert!(!seen_by_origin.is_for("c1"));
        assert!(rx2.try_recv().unwrap().is_for("c2"));
    }

    #[test]
    fn test_room_limit() {
        let hub = RoomHub::with_config(RoomConfig {
            max_rooms_per_connection: 2,
            room_capacity: 16,
        });

        let _a = hub.join("c1", "a").unwrap();
        let _b = hub.join("c1", "b").unwrap();
        assert!(matches!(hub.join("c1", "c"), Err(RoomError::MaxRoomsReached)));
    }

    #[test]
    fn test_leave_all() {
        let hub = RoomHub::new();
        let _a = hub.join("c1", "user:alice").unwrap();
        let _b = hub.join("c1", "group:g").unwrap();
        let _c = hub.join("c2", "group:g").unwrap();

        hub.leave_all("c1");

        assert!(hub.connection_rooms("c1").is_empty());
        assert_eq!(hub.member_count("group:g"), 1);
        assert_eq!(hub.member_count("user:alice"), 0);

        let stats = hub.stats();
        assert_eq!(stats.room_count, 1);
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.total_memberships, 1);
    }
}
