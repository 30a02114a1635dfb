//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Room join/leave and durable scene broadcasts
//! - Volatile pointer updates (dropped silently when offline)
//! - Chat send plus history replay events
//!
//! The client does not reconcile: it surfaces [`CollabEvent`]s and the
//! application runs [`easel_core::reconcile`] on `RemoteUpdate` payloads
//! against its own scene.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use easel_core::{encode_batch, PositionedElement};

use crate::protocol::{BroadcastResult, ChatMessage, ClientMessage, DeliveryClass, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the collab client.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// The server assigned us a session id
    SessionAssigned(Uuid),
    /// We are alone in the room and own its initial state
    FirstInRoom { room_id: String },
    /// Another session joined a room we are in
    NewUser { room_id: String, session_id: Uuid },
    /// Membership changed; full member list
    RoomUserChange { room_id: String, members: Vec<Uuid> },
    /// A remote broadcast; `payload` is an element batch to reconcile
    RemoteUpdate {
        room_id: String,
        payload: Vec<u8>,
        metadata: Vec<u8>,
    },
    /// Buffered chat replayed on join
    ChatHistory {
        room_id: String,
        messages: Vec<ChatMessage>,
    },
    /// A live chat message
    Chat(ChatMessage),
    /// Acknowledgement for one of our requests
    Ack(BroadcastResult),
}

/// The collaboration client.
///
/// Manages a WebSocket connection to the server and translates pushed
/// [`ServerMessage`]s into [`CollabEvent`]s for the application.
pub struct CollabClient {
    /// Server URL, e.g. `ws://127.0.0.1:3002`
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Session id assigned by the server on connect
    session_id: Arc<RwLock<Option<Uuid>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<CollabEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<CollabEvent>,
}

impl CollabClient {
    /// Create a new client.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading and writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(conn) => conn,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            use futures_util::SinkExt;
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(CollabEvent::Connected).await;

        // Reader task: translate server pushes into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let session_slot = self.session_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let server_msg = match ServerMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Undecodable server frame: {e}");
                                continue;
                            }
                        };
                        let event = match server_msg {
                            ServerMessage::SessionInit { session_id } => {
                                *session_slot.write().await = Some(session_id);
                                CollabEvent::SessionAssigned(session_id)
                            }
                            ServerMessage::FirstInRoom { room_id } => {
                                CollabEvent::FirstInRoom { room_id }
                            }
                            ServerMessage::NewUser { room_id, session_id } => {
                                CollabEvent::NewUser { room_id, session_id }
                            }
                            ServerMessage::RoomUserChange { room_id, members } => {
                                CollabEvent::RoomUserChange { room_id, members }
                            }
                            ServerMessage::ClientBroadcast {
                                room_id,
                                payload,
                                metadata,
                            } => CollabEvent::RemoteUpdate {
                                room_id,
                                payload,
                                metadata,
                            },
                            ServerMessage::ChatHistory { room_id, messages } => {
                                CollabEvent::ChatHistory { room_id, messages }
                            }
                            ServerMessage::ChatBroadcast(message) => CollabEvent::Chat(message),
                            ServerMessage::Ack(result) => CollabEvent::Ack(result),
                        };
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            *session_slot.write().await = None;
            let _ = event_tx.send(CollabEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Join a room. Presence events and any chat history arrive as
    /// pushed [`CollabEvent`]s.
    pub async fn join_room(&self, room_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::JoinRoom {
            room_id: room_id.into(),
        })
        .await
    }

    /// Leave a room.
    pub async fn leave_room(&self, room_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::LeaveRoom {
            room_id: room_id.into(),
        })
        .await
    }

    /// Broadcast an element batch to the room (durable delivery).
    ///
    /// Returns the minted correlation id; the matching
    /// [`CollabEvent::Ack`] echoes it back.
    pub async fn broadcast_scene(
        &self,
        room_id: impl Into<String>,
        batch: &[PositionedElement],
    ) -> Result<String, ProtocolError> {
        let message_id = Uuid::new_v4().to_string();
        self.send(&ClientMessage::Broadcast {
            room_id: room_id.into(),
            class: DeliveryClass::Durable,
            payload: encode_batch(batch),
            metadata: Vec::new(),
            message_id: Some(message_id.clone()),
        })
        .await?;
        Ok(message_id)
    }

    /// Broadcast a pointer/presence update (volatile delivery).
    ///
    /// Silently a no-op when disconnected: stale pointer positions are
    /// worthless after reconnect.
    pub async fn broadcast_pointer(
        &self,
        room_id: impl Into<String>,
        metadata: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(&ClientMessage::Broadcast {
            room_id: room_id.into(),
            class: DeliveryClass::Volatile,
            payload: Vec::new(),
            metadata,
            message_id: None,
        })
        .await
    }

    /// Send a chat message; returns the minted message id.
    pub async fn send_chat(
        &self,
        room_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<String, ProtocolError> {
        let message_id = Uuid::new_v4().to_string();
        self.send(&ClientMessage::Chat {
            room_id: room_id.into(),
            message_id: message_id.clone(),
            content: content.into(),
        })
        .await?;
        Ok(message_id)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server-assigned session id, once [`CollabEvent::SessionAssigned`]
    /// has arrived.
    pub async fn session_id(&self) -> Option<Uuid> {
        *self.session_id.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn send(&self, request: &ClientMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = request.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::Element;
    use serde_json::json;

    #[test]
    fn test_client_creation() {
        let client = CollabClient::new("ws://localhost:3002");
        assert_eq!(client.server_url(), "ws://localhost:3002");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = CollabClient::new("ws://localhost:3002");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.session_id().await.is_none());
    }

    #[tokio::test]
    async fn test_requests_fail_when_disconnected() {
        let client = CollabClient::new("ws://localhost:3002");

        assert!(matches!(
            client.join_room("r1").await,
            Err(ProtocolError::ConnectionClosed)
        ));

        let batch = vec![easel_core::PositionedElement {
            position: easel_core::PositionKey::First,
            element: Element::new("a", json!({"kind": "rect"})),
        }];
        assert!(matches!(
            client.broadcast_scene("r1", &batch).await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(matches!(
            client.send_chat("r1", "hi").await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_pointer_broadcast_offline_is_noop() {
        let client = CollabClient::new("ws://localhost:3002");
        // Volatile traffic is dropped, not errored, when offline.
        client.broadcast_pointer("r1", vec![1, 2]).await.unwrap();
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = CollabClient::new("ws://localhost:3002");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing listens on a port we just made up.
        let mut client = CollabClient::new("ws://127.0.0.1:1");
        assert!(matches!(
            client.connect().await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
