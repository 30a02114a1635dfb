//! Fan-out of change events to room members, with two delivery classes.
//!
//! Each connected session owns a typed outbound queue; the relay fans a
//! broadcast out by pushing the event into every other member's queue.
//! Durable sends await queue capacity so document edits are never shed;
//! volatile sends drop silently when a receiver is saturated. The sender
//! never receives its own broadcast back.
//!
//! ```text
//! session A ── broadcast(room, class, payload) ──► BroadcastRelay
//!                                                     │ members_of(room)
//!                                    ┌────────────────┼────────────────┐
//!                                    ▼                ▼                ▼
//!                              queue(B)          queue(C)         queue(D)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{
    BroadcastResult, ChatMessage, DeliveryClass, RelayError, ServerMessage,
};
use crate::registry::RoomRegistry;

/// Outbound queue handle for one connected session.
type SessionSender = mpsc::Sender<Arc<ServerMessage>>;

/// Fan-out counters, tracked with atomics so delivery never takes a lock
/// beyond the session map read.
#[derive(Debug, Default)]
struct AtomicRelayStats {
    durable_sent: AtomicU64,
    volatile_sent: AtomicU64,
    volatile_dropped: AtomicU64,
}

/// Snapshot of relay health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStats {
    pub durable_sent: u64,
    pub volatile_sent: u64,
    pub volatile_dropped: u64,
    pub active_sessions: usize,
}

/// Delivers change events to the right audience with the right
/// reliability class, and runs the join/leave presence protocol.
pub struct BroadcastRelay {
    registry: Arc<RoomRegistry>,
    sessions: RwLock<HashMap<Uuid, SessionSender>>,
    session_buffer: usize,
    shutting_down: AtomicBool,
    stats: AtomicRelayStats,
}

impl BroadcastRelay {
    /// `session_buffer` is the outbound queue depth per session; volatile
    /// events are shed once a session's queue is full.
    pub fn new(registry: Arc<RoomRegistry>, session_buffer: usize) -> Self {
        Self {
            registry,
            sessions: RwLock::new(HashMap::new()),
            session_buffer: session_buffer.max(1),
            shutting_down: AtomicBool::new(false),
            stats: AtomicRelayStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Attach a new session and hand back its outbound event queue.
    pub async fn register_session(
        &self,
        session_id: Uuid,
    ) -> Result<mpsc::Receiver<Arc<ServerMessage>>, RelayError> {
        if self.is_shutting_down() {
            return Err(RelayError::ShuttingDown);
        }
        let (tx, rx) = mpsc::channel(self.session_buffer);
        self.sessions.write().await.insert(session_id, tx);
        Ok(rx)
    }

    /// Join protocol (§ presence): record membership, then
    /// - sole member → `FirstInRoom` to the joiner only;
    /// - otherwise → `NewUser` to the existing members and
    ///   `RoomUserChange` with the full member list to everyone;
    /// - finally replay buffered chat history to the joiner.
    ///
    /// Returns the member count after the join.
    pub async fn join_room(&self, session_id: Uuid, room_id: &str) -> Result<usize, RelayError> {
        if self.is_shutting_down() {
            return Err(RelayError::ShuttingDown);
        }
        if !self.sessions.read().await.contains_key(&session_id) {
            return Err(RelayError::UnknownSession(session_id));
        }

        let count = self.registry.join(session_id, room_id).await?;
        log::info!("session {session_id} joined room {room_id} ({count} members)");

        if count == 1 {
            self.send_durable(
                session_id,
                Arc::new(ServerMessage::FirstInRoom {
                    room_id: room_id.to_string(),
                }),
            )
            .await;
        } else {
            let members = self.registry.members_of(room_id).await;
            let new_user = Arc::new(ServerMessage::NewUser {
                room_id: room_id.to_string(),
                session_id,
            });
            for member in members.iter().filter(|m| **m != session_id) {
                self.send_durable(*member, new_user.clone()).await;
            }
            let change = Arc::new(ServerMessage::RoomUserChange {
                room_id: room_id.to_string(),
                members: members.clone(),
            });
            for member in &members {
                self.send_durable(*member, change.clone()).await;
            }
        }

        let history = self.registry.chat_history(room_id).await;
        if !history.is_empty() {
            log::debug!(
                "replaying {} chat messages to session {session_id} in room {room_id}",
                history.len()
            );
            self.send_durable(
                session_id,
                Arc::new(ServerMessage::ChatHistory {
                    room_id: room_id.to_string(),
                    messages: history,
                }),
            )
            .await;
        }

        Ok(count)
    }

    /// Leave a room and notify the survivors. Idempotent.
    pub async fn leave_room(&self, session_id: Uuid, room_id: &str) {
        let remaining = self.registry.leave(session_id, room_id).await;
        if remaining > 0 {
            let members = self.registry.members_of(room_id).await;
            let change = Arc::new(ServerMessage::RoomUserChange {
                room_id: room_id.to_string(),
                members: members.clone(),
            });
            for member in &members {
                self.send_durable(*member, change.clone()).await;
            }
        }
    }

    /// Fan a change event out to every *other* current member of the
    /// room. Durable events are delivered with backpressure; volatile
    /// events are shed when a member's queue is full. Partial delivery is
    /// not surfaced; only request-level failures are.
    pub async fn broadcast(
        &self,
        session_id: Uuid,
        room_id: &str,
        class: DeliveryClass,
        payload: Vec<u8>,
        metadata: Vec<u8>,
        message_id: Option<String>,
    ) -> Result<BroadcastResult, RelayError> {
        RoomRegistry::validate_room_id(room_id)?;
        if !self.sessions.read().await.contains_key(&session_id) {
            return Err(RelayError::UnknownSession(session_id));
        }

        self.registry.touch(room_id).await;
        let members = self.registry.members_of(room_id).await;
        let event = Arc::new(ServerMessage::ClientBroadcast {
            room_id: room_id.to_string(),
            payload,
            metadata,
        });

        for member in members.iter().filter(|m| **m != session_id) {
            match class {
                DeliveryClass::Durable => self.send_durable(*member, event.clone()).await,
                DeliveryClass::Volatile => self.send_volatile(*member, event.clone()).await,
            }
        }

        Ok(BroadcastResult::ok(message_id))
    }

    /// Store a chat message in the room's bounded history and deliver it
    /// to every member, the sender included.
    pub async fn chat(
        &self,
        session_id: Uuid,
        room_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<BroadcastResult, RelayError> {
        RoomRegistry::validate_room_id(room_id)?;
        if !self.sessions.read().await.contains_key(&session_id) {
            return Err(RelayError::UnknownSession(session_id));
        }
        if message_id.is_empty() {
            return Err(RelayError::MalformedPayload("message id is required".into()));
        }
        if content.is_empty() {
            return Err(RelayError::MalformedPayload(
                "message content is required".into(),
            ));
        }

        let message = ChatMessage::new(message_id, room_id, session_id, content);
        self.registry.push_chat(message.clone()).await;
        self.registry.touch(room_id).await;

        let event = Arc::new(ServerMessage::ChatBroadcast(message));
        for member in &self.registry.members_of(room_id).await {
            self.send_durable(*member, event.clone()).await;
        }

        Ok(BroadcastResult::ok(Some(message_id.to_string())))
    }

    /// Handle a terminated session: detach its queue, remove it from
    /// every room, and push the updated member list to the survivors.
    /// Benign for sessions the relay is not tracking.
    pub async fn disconnect(&self, session_id: Uuid) {
        self.sessions.write().await.remove(&session_id);
        for (room_id, remaining) in self.registry.drop_session(session_id).await {
            log::info!("session {session_id} disconnected from room {room_id}");
            if remaining.is_empty() {
                continue;
            }
            let change = Arc::new(ServerMessage::RoomUserChange {
                room_id,
                members: remaining.clone(),
            });
            for member in &remaining {
                self.send_durable(*member, change.clone()).await;
            }
        }
    }

    /// Refuse new sessions and joins, and close every session queue.
    /// In-flight fan-outs drain; nothing new is accepted.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        if count > 0 {
            log::info!("relay shutdown: closed {count} session queues");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            durable_sent: self.stats.durable_sent.load(Ordering::Relaxed),
            volatile_sent: self.stats.volatile_sent.load(Ordering::Relaxed),
            volatile_dropped: self.stats.volatile_dropped.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
        }
    }

    /// Deliver with backpressure. A closed queue means the session is
    /// tearing down; that is not a relay failure and is not surfaced
    /// per-recipient.
    async fn send_durable(&self, target: Uuid, event: Arc<ServerMessage>) {
        let sender = self.sessions.read().await.get(&target).cloned();
        if let Some(sender) = sender {
            if sender.send(event).await.is_err() {
                log::debug!("session {target} queue closed during durable send");
            } else {
                self.stats.durable_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Best-effort delivery: shed the event if the queue is full.
    async fn send_volatile(&self, target: Uuid, event: Arc<ServerMessage>) {
        let sender = self.sessions.read().await.get(&target).cloned();
        if let Some(sender) = sender {
            match sender.try_send(event) {
                Ok(()) => {
                    self.stats.volatile_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.stats.volatile_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
