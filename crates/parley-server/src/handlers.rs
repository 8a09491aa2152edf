//! Connection handlers for the Parley server.
//!
//! This module owns the HTTP surface and the per-connection loop. Each
//! WebSocket connection is one task that interleaves inbound frames, room
//! traffic from its outbox, and the presence heartbeat.

use crate::auth::{self, Authenticator};
use crate::config::{BrokerKind, Config};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_broker::{Broker, MemoryBroker, RedisBroker};
use parley_core::{Engine, Session};
use parley_protocol::{codec, ClientEvent, ErrorCode, ProtocolError, ServerEvent, WireFormat};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Close code sent when the handshake carries no valid identity.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Shared server state.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub auth: Authenticator,
    pub config: Config,
}

impl AppState {
    #[must_use]
    pub fn new(engine: Arc<Engine>, config: Config) -> Self {
        Self {
            auth: Authenticator::new(&config.auth),
            engine,
            config,
        }
    }
}

/// Connect the configured broker backend.
///
/// # Errors
///
/// Returns an error if the broker cannot be reached.
pub async fn connect_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    let broker: Arc<dyn Broker> = match config.broker.kind {
        BrokerKind::Memory => {
            warn!("Using the in-process broker; state is not shared between servers");
            Arc::new(MemoryBroker::new())
        }
        BrokerKind::Redis => Arc::new(
            RedisBroker::connect(config.redis_config())
                .await
                .with_context(|| format!("Failed to connect to broker at {}", config.broker.url))?,
        ),
    };
    Ok(broker)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the broker, engine or listener fail to start.
pub async fn run_server(config: Config) -> Result<()> {
    let broker = connect_broker(&config).await?;
    let engine = Engine::start(broker, config.engine_config())
        .await
        .context("Failed to start messaging engine")?;
    let state = Arc::new(AppState::new(engine, config.clone()));

    if !state.auth.is_configured() {
        warn!("auth.jwt_secret is not set; every connection will be rejected");
    }

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broker = state.engine.broker();
    let fanout_ready = state.engine.fanout().is_ready();
    let healthy = fanout_ready && broker.is_healthy();

    Json(serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "broker": broker.name(),
        "fanout": fanout_ready,
    }))
}

/// WebSocket upgrade handler. The identity is verified before upgrading and
/// handed to the session, which refuses to open without one.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = state.auth.verify(auth::handshake_token(&query, &headers));
    ws.on_upgrade(move |socket| handle_websocket(socket, state, user_id))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, user_id: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    let (mut session, mut outbox) = match Session::open(state.engine.clone(), user_id).await {
        Ok(opened) => opened,
        Err(e) => {
            metrics::record_rejected();
            warn!(error = %e, "Rejecting connection");
            let _ = send_event(
                &mut sender,
                WireFormat::Json,
                &ServerEvent::error(e.code(), e.to_string()),
            )
            .await;
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: "unauthorized".into(),
                })))
                .await;
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new();
    metrics::set_active_rooms(state.engine.rooms().stats().room_count);

    let connection_id = session.connection_id().to_string();
    debug!(connection = %connection_id, user = %session.user_id(), "WebSocket connected");

    // Replies follow the encoding of the most recent inbound frame.
    let mut format = WireFormat::Json;
    let mut read_buffer = BytesMut::with_capacity(4096);

    let period = state.config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'connection: loop {
        tokio::select! {
            biased;

            Some(event) = outbox.recv() => {
                if send_event(&mut sender, format, &event.event).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                session.refresh_presence().await;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        format = WireFormat::Json;
                        metrics::record_bytes(text.len(), "inbound");
                        let reply = match codec::decode_text(&text) {
                            Ok(event) => handle_event(&mut session, event).await,
                            Err(e) => Some(protocol_error(&connection_id, &e)),
                        };
                        if let Some(reply) = reply {
                            if send_event(&mut sender, format, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        format = WireFormat::MessagePack;
                        metrics::record_bytes(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        loop {
                            let reply = match codec::decode_from(&mut read_buffer) {
                                Ok(Some(event)) => handle_event(&mut session, event).await,
                                Ok(None) => break,
                                Err(e) => {
                                    if matches!(e, ProtocolError::FrameTooLarge(_)) {
                                        read_buffer.clear();
                                    }
                                    Some(protocol_error(&connection_id, &e))
                                }
                            };
                            if let Some(reply) = reply {
                                if send_event(&mut sender, format, &reply).await.is_err() {
                                    break 'connection;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    session.close().await;
    metrics::set_active_rooms(state.engine.rooms().stats().room_count);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Dispatch one decoded event and record its latency.
async fn handle_event(session: &mut Session, event: ClientEvent) -> Option<ServerEvent> {
    let name = event.name();
    let start = Instant::now();
    let reply = session.handle(event).await;
    metrics::record_event(name, start.elapsed().as_secs_f64());
    if let Some(ServerEvent::Error(e)) = &reply {
        metrics::record_error(match e.code {
            ErrorCode::Unavailable => "broker",
            _ => "event",
        });
    }
    reply
}

/// Convert an undecodable frame into an error reply.
fn protocol_error(connection_id: &str, err: &ProtocolError) -> ServerEvent {
    warn!(connection = %connection_id, error = %err, "Bad frame");
    metrics::record_error("protocol");
    let code = match err {
        ProtocolError::InvalidPayload(_) => ErrorCode::Validation,
        _ => ErrorCode::BadRequest,
    };
    ServerEvent::error(code, err.to_string())
}

/// Encode a server event in the given wire format.
fn encode(format: WireFormat, event: &ServerEvent) -> Result<Message, ProtocolError> {
    Ok(match format {
        WireFormat::Json => Message::Text(codec::encode_text(event)?),
        WireFormat::MessagePack => Message::Binary(codec::encode_binary(event)?.to_vec()),
    })
}

/// Send an event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    format: WireFormat,
    event: &ServerEvent,
) -> Result<()> {
    let message = encode(format, event)?;
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_bytes(len, "outbound");
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use parley_core::EngineConfig;
    use parley_protocol::events::Envelope;

    async fn state() -> Arc<AppState> {
        let engine = Engine::start(Arc::new(MemoryBroker::new()), EngineConfig::default())
            .await
            .unwrap();
        Arc::new(AppState::new(engine, Config::default()))
    }

    #[tokio::test]
    async fn test_health_reports_backend() {
        let state = state().await;
        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["broker"], "memory");
        assert_eq!(health["fanout"], true);
    }

    #[test]
    fn test_encode_follows_format() {
        let event = ServerEvent::Pong {};

        match encode(WireFormat::Json, &event).unwrap() {
            Message::Text(text) => {
                let envelope: Envelope = serde_json::from_str(&text).unwrap();
                assert_eq!(envelope.event, "pong");
            }
            other => panic!("expected text frame, got {:?}", other),
        }

        match encode(WireFormat::MessagePack, &event).unwrap() {
            Message::Binary(data) => {
                let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
                assert_eq!(length, data.len() - 4);
            }
            other => panic!("expected binary frame, got {:?}", other),
        }
    }

    #[test]
    fn test_protocol_error_codes() {
        let unknown = protocol_error("c1", &ProtocolError::UnknownEvent("chat:nope".into()));
        assert!(matches!(
            unknown,
            ServerEvent::Error(ref e) if e.code == ErrorCode::BadRequest
        ));

        let invalid = protocol_error("c1", &ProtocolError::InvalidPayload("groupId".into()));
        assert!(matches!(
            invalid,
            ServerEvent::Error(ref e) if e.code == ErrorCode::Validation
        ));
    }

    #[tokio::test]
    async fn test_handle_event_returns_reply() {
        let state = state().await;
        let (mut session, _outbox) = Session::open(state.engine.clone(), Some("alice".into()))
            .await
            .unwrap();

        assert_eq!(
            handle_event(&mut session, ClientEvent::Ping).await,
            Some(ServerEvent::Pong {})
        );

        let mut buf = BytesMut::new();
        codec::encode_into(
            &Envelope {
                event: "chat:get-online-users".into(),
                data: serde_json::json!({}),
            },
            &mut buf,
        )
        .unwrap();
        let event = codec::decode_from(&mut buf).unwrap().unwrap();
        match handle_event(&mut session, event).await {
            Some(ServerEvent::OnlineUsers(online)) => {
                assert_eq!(online.users, vec!["alice".to_string()]);
            }
            other => panic!("expected online users, got {:?}", other),
        }
        session.close().await;
    }
}
