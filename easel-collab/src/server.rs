//! WebSocket server for room-based drawing collaboration.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── RoomRegistry (membership + chat history)
//! Client B ──┤           │
//!             │           ▼
//! Client C ──┘    BroadcastRelay ── per-session queues ──► Clients
//! ```
//!
//! Every connection gets a server-minted session id and a typed
//! outbound queue. The server owns the socket; the relay owns routing.
//! Payloads are forwarded verbatim — the server never deserializes an
//! element batch, it only enforces the frame size cap.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{BroadcastResult, ClientMessage, ServerMessage};
use crate::registry::RoomRegistry;
use crate::relay::BroadcastRelay;
use crate::store::DocumentStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue depth per session
    pub session_buffer: usize,
    /// Largest accepted WebSocket frame, in bytes
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3002".to_string(),
            session_buffer: 256,
            max_message_bytes: 5_000_000,
        }
    }
}

impl ServerConfig {
    /// Build a config from `EASEL_BIND_ADDR`, `EASEL_SESSION_BUFFER`
    /// and `EASEL_MAX_MESSAGE_BYTES`, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("EASEL_BIND_ADDR").unwrap_or(defaults.bind_addr),
            session_buffer: std::env::var("EASEL_SESSION_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.session_buffer),
            max_message_bytes: std::env::var("EASEL_MAX_MESSAGE_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_message_bytes),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    relay: Arc<BroadcastRelay>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown_tx: watch::Sender<bool>,
    /// Optional persistence collaborator; the relay itself never calls it.
    store: Option<Arc<dyn DocumentStore>>,
}

impl CollabServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let relay = Arc::new(BroadcastRelay::new(registry.clone(), config.session_buffer));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registry,
            relay,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown_tx,
            store: None,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Attach a document store.
    pub fn with_document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs until [`shutdown`](Self::shutdown) is called, then drains
    /// the relay and returns.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab server listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let relay = self.relay.clone();
                    let stats = self.stats.clone();
                    let config = self.config.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, addr, relay, stats, config).await
                        {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("Collab server shutting down");
        self.relay.shutdown().await;
        Ok(())
    }

    /// Signal the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Arc<BroadcastRelay>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let session_id = Uuid::new_v4();
        let mut outbound = match relay.register_session(session_id).await {
            Ok(rx) => rx,
            Err(e) => {
                log::warn!("Refusing connection from {addr}: {e}");
                let _ = ws_sender.close().await;
                return Ok(());
            }
        };

        log::info!("Session {session_id} established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // First frame on every connection: the assigned session id.
        let init = ServerMessage::SessionInit { session_id }.encode()?;
        ws_sender.send(Message::Binary(init.into())).await?;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            if bytes.len() > config.max_message_bytes {
                                log::warn!(
                                    "Session {session_id} sent oversized frame ({} bytes)",
                                    bytes.len()
                                );
                                let ack = ServerMessage::Ack(BroadcastResult::failure(
                                    "malformed payload: frame exceeds size limit",
                                    None,
                                ));
                                ws_sender.send(Message::Binary(ack.encode()?.into())).await?;
                                continue;
                            }

                            let ack = match ClientMessage::decode(&bytes) {
                                Ok(request) => {
                                    Self::dispatch(&relay, session_id, request).await
                                }
                                Err(e) => {
                                    log::warn!("Undecodable frame from session {session_id}: {e}");
                                    BroadcastResult::failure(format!("malformed payload: {e}"), None)
                                }
                            };
                            let encoded = ServerMessage::Ack(ack).encode()?;
                            ws_sender.send(Message::Binary(encoded.into())).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Session {session_id} closed ({addr})");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from session {session_id}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing relay event
                event = outbound.recv() => {
                    match event {
                        Some(event) => {
                            let encoded = event.encode()?;
                            ws_sender.send(Message::Binary(encoded.into())).await?;
                        }
                        // Queue detached: relay shutdown or forced disconnect.
                        None => break,
                    }
                }
            }
        }

        relay.disconnect(session_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        Ok(())
    }

    /// Route one request to the relay and shape the acknowledgement.
    /// Request-level failures become error acks; they never tear down
    /// the connection.
    async fn dispatch(
        relay: &BroadcastRelay,
        session_id: Uuid,
        request: ClientMessage,
    ) -> BroadcastResult {
        match request {
            ClientMessage::JoinRoom { room_id } => {
                match relay.join_room(session_id, &room_id).await {
                    Ok(count) => BroadcastResult::joined(count),
                    Err(e) => BroadcastResult::failure(e.to_string(), None),
                }
            }
            ClientMessage::LeaveRoom { room_id } => {
                relay.leave_room(session_id, &room_id).await;
                BroadcastResult::ok(None)
            }
            ClientMessage::Broadcast {
                room_id,
                class,
                payload,
                metadata,
                message_id,
            } => {
                let echo = message_id.clone();
                match relay
                    .broadcast(session_id, &room_id, class, payload, metadata, message_id)
                    .await
                {
                    Ok(result) => result,
                    Err(e) => BroadcastResult::failure(e.to_string(), echo),
                }
            }
            ClientMessage::Chat {
                room_id,
                message_id,
                content,
            } => match relay.chat(session_id, &room_id, &message_id, &content).await {
                Ok(result) => result,
                Err(e) => BroadcastResult::failure(e.to_string(), Some(message_id)),
            },
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get the broadcast relay.
    pub fn relay(&self) -> &Arc<BroadcastRelay> {
        &self.relay
    }

    /// Get the document store (if attached).
    pub fn store(&self) -> Option<&Arc<dyn DocumentStore>> {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AckStatus, DeliveryClass};
    use crate::store::MemoryStore;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3002");
        assert_eq!(config.session_buffer, 256);
        assert_eq!(config.max_message_bytes, 5_000_000);
    }

    #[test]
    fn test_server_creation() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:3002");
        assert!(server.store().is_none());
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            session_buffer: 64,
            max_message_bytes: 1_000_000,
        };
        let server = CollabServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_server_with_store() {
        let server =
            CollabServer::with_defaults().with_document_store(Arc::new(MemoryStore::new()));
        assert!(server.store().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = CollabServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_dispatch_join_and_broadcast() {
        let server = CollabServer::with_defaults();
        let session = Uuid::new_v4();
        let _rx = server.relay().register_session(session).await.unwrap();

        let ack = CollabServer::dispatch(
            server.relay(),
            session,
            ClientMessage::JoinRoom {
                room_id: "r1".into(),
            },
        )
        .await;
        assert!(ack.is_ok());
        assert_eq!(ack.member_count, Some(1));

        let ack = CollabServer::dispatch(
            server.relay(),
            session,
            ClientMessage::Broadcast {
                room_id: "r1".into(),
                class: DeliveryClass::Durable,
                payload: vec![1],
                metadata: vec![],
                message_id: Some("m-1".into()),
            },
        )
        .await;
        assert!(ack.is_ok());
        assert_eq!(ack.message_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn test_dispatch_failure_becomes_error_ack() {
        let server = CollabServer::with_defaults();
        let session = Uuid::new_v4();
        let _rx = server.relay().register_session(session).await.unwrap();

        // Invalid room id fails the request, keeps the correlation id.
        let ack = CollabServer::dispatch(
            server.relay(),
            session,
            ClientMessage::Broadcast {
                room_id: String::new(),
                class: DeliveryClass::Durable,
                payload: vec![],
                metadata: vec![],
                message_id: Some("m-9".into()),
            },
        )
        .await;
        assert_eq!(ack.status, AckStatus::Error);
        assert_eq!(ack.message_id.as_deref(), Some("m-9"));
        assert!(ack.error.as_deref().unwrap().contains("invalid room id"));
    }

    #[tokio::test]
    async fn test_dispatch_leave_is_idempotent() {
        let server = CollabServer::with_defaults();
        let session = Uuid::new_v4();
        let _rx = server.relay().register_session(session).await.unwrap();

        // Leaving a room never joined still acks ok.
        let ack = CollabServer::dispatch(
            server.relay(),
            session,
            ClientMessage::LeaveRoom {
                room_id: "r1".into(),
            },
        )
        .await;
        assert!(ack.is_ok());
    }
}
