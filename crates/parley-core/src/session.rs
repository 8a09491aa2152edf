//! Per-connection event handling.
//!
//! A [`Session`] exists for each authenticated connection. It joins the
//! user's personal room on open, dispatches inbound [`ClientEvent`]s one at a
//! time, and converts every downstream failure into a `chat:error` reply.
//! Room traffic for the connection is forwarded into a single outbox that the
//! transport drains alongside replies.

use crate::conversation::Conversation;
use crate::engine::Engine;
use crate::error::{ChatError, ErrorKind};
use crate::keys;
use crate::now_ms;
use crate::rooms::RoomEvent;
use parley_protocol::events::{
    CheckOnline, DeliveryQuery, DeliveryStatus, DirectHistory, DirectHistoryQuery, GroupHistory,
    GroupHistoryQuery, GroupRef, MembershipChange, MessageAck, MessageRef, OnlineStatus,
    OnlineUsers, SendDirect, SendGroup, SentAck, Typing, TypingDirect, TypingGroup,
};
use parley_protocol::{validate_identifier, ClientEvent, ConversationKind, ServerEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receiver for room traffic addressed to one connection.
pub type Outbox = mpsc::UnboundedReceiver<Arc<RoomEvent>>;

/// Per-connection state.
pub struct Session {
    engine: Arc<Engine>,
    connection_id: String,
    user_id: String,
    /// Group id -> forwarder for the group's room.
    groups: HashMap<String, JoinHandle<()>>,
    personal: Option<JoinHandle<()>>,
    outbox: mpsc::UnboundedSender<Arc<RoomEvent>>,
}

impl Session {
    /// Open a session for a verified identity.
    ///
    /// Joins the user's personal room and registers presence. A presence
    /// failure is logged and the session proceeds.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Unauthenticated`] if no valid identity is given;
    /// the connection must then be closed.
    pub async fn open(
        engine: Arc<Engine>,
        user_id: Option<String>,
    ) -> Result<(Self, Outbox), ChatError> {
        let Some(user_id) = user_id.filter(|id| validate_identifier(id).is_ok()) else {
            error!("Connection without a verified identity");
            return Err(ChatError::Unauthenticated);
        };

        let connection_id = uuid::Uuid::new_v4().to_string();
        let (outbox, rx) = mpsc::unbounded_channel();

        let mut session = Self {
            engine,
            connection_id,
            user_id,
            groups: HashMap::new(),
            personal: None,
            outbox,
        };

        let personal = session
            .engine
            .rooms()
            .join(&session.connection_id, &keys::user_room(&session.user_id))?;
        session.personal = Some(session.forward(personal));

        if let Err(e) = session
            .engine
            .presence()
            .mark_online(&session.user_id, &session.connection_id)
            .await
        {
            error!(user = %session.user_id, error = %e, "Error setting user online");
        }

        info!(user = %session.user_id, connection = %session.connection_id, "Session opened");
        Ok((session, rx))
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Connection id, also used as the presence session id.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Groups joined on this connection.
    #[must_use]
    pub fn joined_groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Handle one inbound event, returning the reply for this connection.
    ///
    /// Typing indicators produce no reply.
    pub async fn handle(&mut self, event: ClientEvent) -> Option<ServerEvent> {
        let name = event.name();
        let result = match event {
            ClientEvent::SendDirect(p) => self.send_direct(p).await.map(Some),
            ClientEvent::GetDirectHistory(p) => self.direct_history(p).await.map(Some),
            ClientEvent::JoinGroup(p) => self.join_group(p).map(Some),
            ClientEvent::LeaveGroup(p) => self.leave_group(p).await.map(Some),
            ClientEvent::SendGroup(p) => self.send_group(p).await.map(Some),
            ClientEvent::GetGroupHistory(p) => self.group_history(p).await.map(Some),
            ClientEvent::TypingDirect(p) => {
                self.typing_direct(p);
                Ok(None)
            }
            ClientEvent::TypingGroup(p) => {
                self.typing_group(p);
                Ok(None)
            }
            ClientEvent::MarkDelivered(p) => self.mark_delivered(p).await.map(Some),
            ClientEvent::MarkRead(p) => self.mark_read(p).await.map(Some),
            ClientEvent::GetDeliveryStatus(p) => self.delivery_status(p).await.map(Some),
            ClientEvent::CheckOnline(p) => self.check_online(p).await.map(Some),
            ClientEvent::GetOnlineUsers => self.online_users().await.map(Some),
            ClientEvent::Ping => Ok(Some(ServerEvent::Pong {})),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                match &e {
                    ChatError::Broker(err) if err.is_transient() => {
                        warn!(
                            user = %self.user_id,
                            event = name,
                            error = %e,
                            "Broker unavailable"
                        );
                    }
                    _ if e.kind() == ErrorKind::Infrastructure => {
                        error!(user = %self.user_id, event = name, error = %e, "Event failed");
                    }
                    _ => {
                        warn!(user = %self.user_id, event = name, error = %e, "Event rejected");
                    }
                }
                Some(ServerEvent::error(e.code(), e.to_string()))
            }
        }
    }

    /// Re-assert presence so the TTL marker outlives long connections.
    pub async fn refresh_presence(&self) {
        if let Err(e) = self
            .engine
            .presence()
            .mark_online(&self.user_id, &self.connection_id)
            .await
        {
            warn!(user = %self.user_id, error = %e, "Presence refresh failed");
        }
    }

    /// Tear down the session: leave all rooms and remove this connection's
    /// presence session.
    pub async fn close(mut self) {
        self.release();
        if let Err(e) = self
            .engine
            .presence()
            .mark_offline(&self.user_id, Some(&self.connection_id))
            .await
        {
            error!(user = %self.user_id, error = %e, "Error setting user offline");
        }
        info!(user = %self.user_id, connection = %self.connection_id, "Session closed");
    }

    fn release(&mut self) {
        for (_, forwarder) in self.groups.drain() {
            forwarder.abort();
        }
        if let Some(forwarder) = self.personal.take() {
            forwarder.abort();
        }
        self.engine.rooms().leave_all(&self.connection_id);
    }

    /// Forward a room receiver into the outbox, skipping events this
    /// connection originated.
    fn forward(&self, mut rx: broadcast::Receiver<Arc<RoomEvent>>) -> JoinHandle<()> {
        let outbox = self.outbox.clone();
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if !event.is_for(&connection_id) {
                            continue;
                        }
                        if outbox.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(connection = %connection_id, skipped, "Room receiver lagged");
                    }
                }
            }
        })
    }

    fn check_body(&self, message: &str) -> Result<(), ChatError> {
        let limit = self.engine.config().max_message_size;
        if message.len() > limit {
            return Err(ChatError::validation(format!(
                "message exceeds {} bytes",
                limit
            )));
        }
        Ok(())
    }

    async fn send_direct(&self, p: SendDirect) -> Result<ServerEvent, ChatError> {
        if p.recipient_id.is_empty() || p.message.is_empty() {
            return Err(ChatError::validation("recipientId and message are required"));
        }
        identifier("recipientId", &p.recipient_id)?;
        if p.recipient_id == self.user_id {
            return Err(ChatError::validation("Cannot send message to yourself"));
        }
        self.check_body(&p.message)?;

        let stored = self
            .engine
            .send_direct(&self.user_id, &p.recipient_id, &p.message, p.metadata)
            .await?;

        Ok(ServerEvent::Sent(SentAck {
            kind: ConversationKind::Dm,
            recipient_id: Some(p.recipient_id),
            group_id: None,
            message: p.message,
            message_id: stored.id,
        }))
    }

    fn history_limit(&self, limit: Option<usize>) -> usize {
        limit.unwrap_or(self.engine.store().config().history_default_limit)
    }

    async fn direct_history(&self, p: DirectHistoryQuery) -> Result<ServerEvent, ChatError> {
        if p.other_user_id.is_empty() {
            return Err(ChatError::validation("otherUserId is required"));
        }
        identifier("otherUserId", &p.other_user_id)?;

        let conversation = Conversation::direct(self.user_id.as_str(), p.other_user_id.as_str());
        let messages = self
            .engine
            .store()
            .history(&conversation, self.history_limit(p.limit))
            .await?;

        Ok(ServerEvent::DirectHistory(DirectHistory {
            other_user_id: p.other_user_id,
            messages,
        }))
    }

    fn join_group(&mut self, p: GroupRef) -> Result<ServerEvent, ChatError> {
        group_id(&p.group_id)?;

        if self.groups.contains_key(&p.group_id) {
            debug!(user = %self.user_id, group = %p.group_id, "Already joined");
            return Ok(ServerEvent::JoinedGroup(p));
        }

        let room = keys::group_room(&p.group_id);
        let rx = self.engine.rooms().join(&self.connection_id, &room)?;
        let forwarder = self.forward(rx);
        self.groups.insert(p.group_id.clone(), forwarder);

        self.engine.rooms().emit_from(
            &room,
            &self.connection_id,
            ServerEvent::UserJoined(MembershipChange {
                group_id: p.group_id.clone(),
                user_id: self.user_id.clone(),
                timestamp: now_ms(),
            }),
        );

        info!(user = %self.user_id, group = %p.group_id, "Joined group");
        Ok(ServerEvent::JoinedGroup(p))
    }

    async fn leave_group(&mut self, p: GroupRef) -> Result<ServerEvent, ChatError> {
        group_id(&p.group_id)?;

        let room = keys::group_room(&p.group_id);
        if let Some(forwarder) = self.groups.remove(&p.group_id) {
            forwarder.abort();
            if let Err(e) = self.engine.rooms().leave(&self.connection_id, &room) {
                debug!(error = %e, "Room already left");
            }
        }

        self.engine
            .groups()
            .remove_member(&p.group_id, &self.user_id)
            .await?;

        self.engine.rooms().emit_from(
            &room,
            &self.connection_id,
            ServerEvent::UserLeft(MembershipChange {
                group_id: p.group_id.clone(),
                user_id: self.user_id.clone(),
                timestamp: now_ms(),
            }),
        );

        info!(user = %self.user_id, group = %p.group_id, "Left group");
        Ok(ServerEvent::LeftGroup(p))
    }

    async fn send_group(&self, p: SendGroup) -> Result<ServerEvent, ChatError> {
        if p.group_id.is_empty() || p.message.is_empty() {
            return Err(ChatError::validation("groupId and message are required"));
        }
        identifier("groupId", &p.group_id)?;
        if !self.groups.contains_key(&p.group_id) {
            return Err(ChatError::forbidden("You must join the group first"));
        }
        self.check_body(&p.message)?;

        let stored = self
            .engine
            .send_group(&self.user_id, &p.group_id, &p.message, p.metadata)
            .await?;

        Ok(ServerEvent::Sent(SentAck {
            kind: ConversationKind::Group,
            recipient_id: None,
            group_id: Some(p.group_id),
            message: p.message,
            message_id: stored.id,
        }))
    }

    async fn group_history(&self, p: GroupHistoryQuery) -> Result<ServerEvent, ChatError> {
        group_id(&p.group_id)?;

        let messages = self
            .engine
            .store()
            .history(&Conversation::group(p.group_id.as_str()), self.history_limit(p.limit))
            .await?;

        Ok(ServerEvent::GroupHistory(GroupHistory {
            group_id: p.group_id,
            messages,
        }))
    }

    fn typing_direct(&self, p: TypingDirect) {
        if identifier("recipientId", &p.recipient_id).is_err() {
            debug!(user = %self.user_id, "Ignoring typing indicator without recipient");
            return;
        }
        self.engine.rooms().emit_from(
            &keys::user_room(&p.recipient_id),
            &self.connection_id,
            ServerEvent::Typing(Typing {
                user_id: self.user_id.clone(),
                recipient_id: Some(p.recipient_id),
                group_id: None,
                is_typing: p.is_typing,
                kind: ConversationKind::Dm,
            }),
        );
    }

    fn typing_group(&self, p: TypingGroup) {
        if identifier("groupId", &p.group_id).is_err() {
            debug!(user = %self.user_id, "Ignoring typing indicator without group");
            return;
        }
        self.engine.rooms().emit_from(
            &keys::group_room(&p.group_id),
            &self.connection_id,
            ServerEvent::Typing(Typing {
                user_id: self.user_id.clone(),
                recipient_id: None,
                group_id: Some(p.group_id),
                is_typing: p.is_typing,
                kind: ConversationKind::Group,
            }),
        );
    }

    async fn mark_delivered(&self, p: MessageAck) -> Result<ServerEvent, ChatError> {
        message_id(&p.message_id)?;
        self.engine
            .delivery()
            .mark_delivered(&self.user_id, &p.message_id)
            .await?;
        Ok(ServerEvent::Delivered(MessageRef {
            message_id: p.message_id,
        }))
    }

    async fn mark_read(&self, p: MessageAck) -> Result<ServerEvent, ChatError> {
        message_id(&p.message_id)?;
        self.engine
            .delivery()
            .mark_read(&self.user_id, &p.message_id)
            .await?;
        Ok(ServerEvent::Read(MessageRef {
            message_id: p.message_id,
        }))
    }

    async fn delivery_status(&self, p: DeliveryQuery) -> Result<ServerEvent, ChatError> {
        let recipients = match p.recipient_ids {
            Some(recipients) if !p.message_id.is_empty() => recipients,
            _ => {
                return Err(ChatError::validation(
                    "messageId and recipientIds array are required",
                ))
            }
        };
        identifier("messageId", &p.message_id)?;
        for recipient in &recipients {
            identifier("recipientIds", recipient)?;
        }

        let status = self
            .engine
            .delivery()
            .delivery_status(&p.message_id, &recipients)
            .await?;
        Ok(ServerEvent::DeliveryStatus(DeliveryStatus {
            message_id: p.message_id,
            status,
        }))
    }

    async fn check_online(&self, p: CheckOnline) -> Result<ServerEvent, ChatError> {
        if p.user_id.is_empty() {
            return Err(ChatError::validation("userId is required"));
        }
        identifier("userId", &p.user_id)?;
        let online = self.engine.presence().is_online(&p.user_id).await?;
        Ok(ServerEvent::OnlineStatus(OnlineStatus {
            user_id: p.user_id,
            online,
        }))
    }

    async fn online_users(&self) -> Result<ServerEvent, ChatError> {
        let users = self.engine.presence().online_users().await?;
        Ok(ServerEvent::OnlineUsers(OnlineUsers { users }))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Covers sessions dropped without close(); presence then expires by TTL.
        self.release();
    }
}

fn identifier(field: &str, value: &str) -> Result<(), ChatError> {
    validate_identifier(value)
        .map_err(|reason| ChatError::validation(format!("{}: {}", field, reason)))
}

fn group_id(value: &str) -> Result<(), ChatError> {
    if value.is_empty() {
        return Err(ChatError::validation("groupId is required"));
    }
    identifier("groupId", value)
}

fn message_id(value: &str) -> Result<(), ChatError> {
    if value.is_empty() {
        return Err(ChatError::validation("messageId is required"));
    }
    identifier("messageId", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::testing::FlakyBroker;
    use parley_broker::MemoryBroker;
    use parley_protocol::events::ErrorPayload;
    use parley_protocol::ErrorCode;
    use std::time::Duration;

    async fn engine() -> Arc<Engine> {
        Engine::start(Arc::new(MemoryBroker::new()), EngineConfig::default())
            .await
            .unwrap()
    }

    async fn open(engine: &Arc<Engine>, user: &str) -> (Session, Outbox) {
        Session::open(engine.clone(), Some(user.to_string()))
            .await
            .unwrap()
    }

    async fn next_event(outbox: &mut Outbox) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(1), outbox.recv())
            .await
            .expect("timed out waiting for room event")
            .expect("outbox closed")
            .event
            .clone()
    }

    async fn assert_quiet(outbox: &mut Outbox) {
        let result = tokio::time::timeout(Duration::from_millis(100), outbox.recv()).await;
        assert!(result.is_err(), "unexpected event {:?}", result);
    }

    fn error_code(reply: Option<ServerEvent>) -> ErrorCode {
        match reply {
            Some(ServerEvent::Error(ErrorPayload { code, .. })) => code,
            other => panic!("expected error, got {:?}", other),
        }
    }

    fn join(group: &str) -> ClientEvent {
        ClientEvent::JoinGroup(GroupRef {
            group_id: group.into(),
        })
    }

    fn send_group(group: &str, message: &str) -> ClientEvent {
        ClientEvent::SendGroup(SendGroup {
            group_id: group.into(),
            message: message.into(),
            metadata: None,
        })
    }

    #[tokio::test]
    async fn test_open_requires_identity() {
        let engine = engine().await;
        assert!(matches!(
            Session::open(engine.clone(), None).await,
            Err(ChatError::Unauthenticated)
        ));
        assert!(matches!(
            Session::open(engine, Some("bad:id".into())).await,
            Err(ChatError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_open_and_close_track_presence() {
        let engine = engine().await;
        let (first, _rx1) = open(&engine, "alice").await;
        let (second, _rx2) = open(&engine, "alice").await;
        assert!(engine.presence().is_online("alice").await.unwrap());

        first.close().await;
        assert!(engine.presence().is_online("alice").await.unwrap());

        second.close().await;
        assert!(!engine.presence().is_online("alice").await.unwrap());
        assert_eq!(engine.rooms().stats().room_count, 0);
    }

    #[tokio::test]
    async fn test_direct_message_live_and_history() {
        let engine = engine().await;
        let (mut alice, _alice_rx) = open(&engine, "alice").await;
        let (mut bob, mut bob_rx) = open(&engine, "bob").await;

        let reply = alice
            .handle(ClientEvent::SendDirect(SendDirect {
                recipient_id: "bob".into(),
                message: "hi".into(),
                metadata: None,
            }))
            .await;
        let message_id = match reply {
            Some(ServerEvent::Sent(ack)) => {
                assert_eq!(ack.kind, ConversationKind::Dm);
                assert_eq!(ack.recipient_id.as_deref(), Some("bob"));
                ack.message_id
            }
            other => panic!("expected sent ack, got {:?}", other),
        };

        let mut live = None;
        for _ in 0..2 {
            if let ServerEvent::Message(event) = next_event(&mut bob_rx).await {
                live = Some(event);
            }
        }
        let live = live.expect("live message");
        assert_eq!(live.message.sender_id, "alice");
        assert_eq!(live.message.message, "hi");
        assert_eq!(live.message.message_id, message_id);

        let reply = bob
            .handle(ClientEvent::GetDirectHistory(DirectHistoryQuery {
                other_user_id: "alice".into(),
                limit: None,
            }))
            .await;
        match reply {
            Some(ServerEvent::DirectHistory(history)) => {
                assert_eq!(history.other_user_id, "alice");
                assert_eq!(history.messages.len(), 1);
                assert_eq!(history.messages[0].sender_id, "alice");
                assert_eq!(history.messages[0].message, "hi");
                assert_eq!(history.messages[0].id, message_id);
            }
            other => panic!("expected history, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_direct_message_validation() {
        let engine = engine().await;
        let (mut alice, _rx) = open(&engine, "alice").await;

        let to_self = alice
            .handle(ClientEvent::SendDirect(SendDirect {
                recipient_id: "alice".into(),
                message: "me".into(),
                metadata: None,
            }))
            .await;
        assert_eq!(error_code(to_self), ErrorCode::Validation);

        let missing = alice
            .handle(ClientEvent::SendDirect(SendDirect::default()))
            .await;
        assert_eq!(error_code(missing), ErrorCode::Validation);

        let history = engine
            .store()
            .history(&Conversation::direct("alice", "alice"), 10)
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_group_fanout_and_pending() {
        let engine = engine().await;
        for user in ["alice", "bob", "carol"] {
            engine.groups().add_member("g", user).await.unwrap();
        }

        let (mut alice, mut alice_rx) = open(&engine, "alice").await;
        let (mut bob, mut bob_rx) = open(&engine, "bob").await;
        let (mut carol, mut carol_rx) = open(&engine, "carol").await;

        for session in [&mut alice, &mut bob, &mut carol] {
            assert!(matches!(
                session.handle(join("g")).await,
                Some(ServerEvent::JoinedGroup(_))
            ));
        }

        // Drain user-joined broadcasts: alice sees bob and carol, bob sees carol.
        for _ in 0..2 {
            assert!(matches!(next_event(&mut alice_rx).await, ServerEvent::UserJoined(_)));
        }
        assert!(matches!(next_event(&mut bob_rx).await, ServerEvent::UserJoined(_)));

        let reply = alice.handle(send_group("g", "hello")).await;
        let message_id = match reply {
            Some(ServerEvent::Sent(ack)) => ack.message_id,
            other => panic!("expected sent ack, got {:?}", other),
        };

        for rx in [&mut alice_rx, &mut bob_rx, &mut carol_rx] {
            match next_event(rx).await {
                ServerEvent::Message(live) => {
                    assert_eq!(live.kind, ConversationKind::Group);
                    assert_eq!(live.message.message_id, message_id);
                }
                other => panic!("expected live message, got {:?}", other),
            }
        }
        assert_quiet(&mut bob_rx).await;
        assert_quiet(&mut carol_rx).await;

        for user in ["bob", "carol"] {
            let pending = engine.delivery().pending(user).await.unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].message_id, message_id);
        }
        assert!(engine.delivery().pending("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_group_requires_join() {
        let engine = engine().await;
        let (mut alice, _rx) = open(&engine, "alice").await;

        let reply = alice.handle(send_group("g", "sneaky")).await;
        assert_eq!(error_code(reply), ErrorCode::Forbidden);

        let history = engine
            .store()
            .history(&Conversation::group("g"), 10)
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_join_is_idempotent_and_leave_broadcasts() {
        let engine = engine().await;
        engine.groups().add_member("g", "alice").await.unwrap();
        let (mut alice, _alice_rx) = open(&engine, "alice").await;
        let (mut bob, mut bob_rx) = open(&engine, "bob").await;

        bob.handle(join("g")).await;
        alice.handle(join("g")).await;
        assert!(matches!(next_event(&mut bob_rx).await, ServerEvent::UserJoined(_)));

        assert!(matches!(
            alice.handle(join("g")).await,
            Some(ServerEvent::JoinedGroup(_))
        ));
        assert_quiet(&mut bob_rx).await;
        assert_eq!(alice.joined_groups(), vec!["g".to_string()]);

        let reply = alice
            .handle(ClientEvent::LeaveGroup(GroupRef {
                group_id: "g".into(),
            }))
            .await;
        assert!(matches!(reply, Some(ServerEvent::LeftGroup(_))));
        match next_event(&mut bob_rx).await {
            ServerEvent::UserLeft(change) => assert_eq!(change.user_id, "alice"),
            other => panic!("expected user-left, got {:?}", other),
        }

        assert!(engine.groups().members("g").await.unwrap().is_empty());
        assert!(alice.joined_groups().is_empty());
        assert_eq!(error_code(alice.handle(send_group("g", "x")).await), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_typing_skips_origin_connection() {
        let engine = engine().await;
        let (mut alice, mut alice_rx) = open(&engine, "alice").await;
        let (mut bob, mut bob_rx) = open(&engine, "bob").await;
        alice.handle(join("g")).await;
        bob.handle(join("g")).await;
        assert!(matches!(next_event(&mut alice_rx).await, ServerEvent::UserJoined(_)));

        let reply = alice
            .handle(ClientEvent::TypingGroup(TypingGroup {
                group_id: "g".into(),
                is_typing: true,
            }))
            .await;
        assert!(reply.is_none());

        match next_event(&mut bob_rx).await {
            ServerEvent::Typing(typing) => {
                assert_eq!(typing.user_id, "alice");
                assert_eq!(typing.kind, ConversationKind::Group);
                assert!(typing.is_typing);
            }
            other => panic!("expected typing, got {:?}", other),
        }
        assert_quiet(&mut alice_rx).await;

        alice
            .handle(ClientEvent::TypingDirect(TypingDirect {
                recipient_id: "bob".into(),
                is_typing: false,
            }))
            .await;
        assert!(matches!(
            next_event(&mut bob_rx).await,
            ServerEvent::Typing(Typing { kind: ConversationKind::Dm, is_typing: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_broker_outage_is_reported_and_session_survives() {
        let broker = Arc::new(FlakyBroker::new());
        let engine = Engine::start(broker.clone(), EngineConfig::default())
            .await
            .unwrap();
        let (mut alice, _rx) = open(&engine, "alice").await;
        alice.handle(join("g")).await;

        broker.fail_all(true);
        let reply = alice.handle(send_group("g", "lost")).await;
        assert_eq!(error_code(reply), ErrorCode::Unavailable);
        let reply = alice
            .handle(ClientEvent::CheckOnline(CheckOnline {
                user_id: "bob".into(),
            }))
            .await;
        assert_eq!(error_code(reply), ErrorCode::Unavailable);
        assert_eq!(alice.handle(ClientEvent::Ping).await, Some(ServerEvent::Pong {}));

        broker.heal();
        let reply = alice.handle(send_group("g", "back")).await;
        assert!(matches!(reply, Some(ServerEvent::Sent(ref ack)) if ack.message == "back"));

        let history = engine
            .store()
            .history(&Conversation::group("g"), 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "back");
    }

    #[tokio::test]
    async fn test_receipts_and_presence_queries() {
        let engine = engine().await;
        let (mut bob, _rx) = open(&engine, "bob").await;

        let ack = bob
            .handle(ClientEvent::MarkDelivered(MessageAck {
                message_id: "1-0".into(),
                kind: None,
            }))
            .await;
        assert!(matches!(ack, Some(ServerEvent::Delivered(ref r)) if r.message_id == "1-0"));

        let status = bob
            .handle(ClientEvent::GetDeliveryStatus(DeliveryQuery {
                message_id: "1-0".into(),
                recipient_ids: Some(vec!["bob".into()]),
            }))
            .await;
        match status {
            Some(ServerEvent::DeliveryStatus(s)) => {
                assert!(s.status["bob"].delivered);
                assert!(!s.status["bob"].read);
            }
            other => panic!("expected delivery status, got {:?}", other),
        }

        let missing = bob
            .handle(ClientEvent::GetDeliveryStatus(DeliveryQuery {
                message_id: "1-0".into(),
                recipient_ids: None,
            }))
            .await;
        assert_eq!(error_code(missing), ErrorCode::Validation);

        let online = bob
            .handle(ClientEvent::CheckOnline(CheckOnline {
                user_id: "bob".into(),
            }))
            .await;
        assert!(matches!(online, Some(ServerEvent::OnlineStatus(ref s)) if s.online));

        let users = bob.handle(ClientEvent::GetOnlineUsers).await;
        assert!(matches!(
            users,
            Some(ServerEvent::OnlineUsers(ref u)) if u.users == vec!["bob".to_string()]
        ));

        assert_eq!(bob.handle(ClientEvent::Ping).await, Some(ServerEvent::Pong {}));
    }
}
