//! Authoritative bookkeeping of who is in which room right now.
//!
//! The registry is an owned value passed to the relay as a dependency,
//! never global state. Membership and chat history live behind two
//! independent read/write locks so room listing and history reads do
//! not contend with each other's writers; operations touching the same
//! room serialize on the relevant lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::SystemTime;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{ChatMessage, RelayError};

/// Upper bound on buffered chat messages per room; oldest are evicted.
pub const MAX_CHAT_MESSAGES_PER_ROOM: usize = 1000;

const MAX_ROOM_ID_BYTES: usize = 512;

/// One row of the operational room listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    pub room_id: String,
    pub member_count: usize,
    pub last_active: SystemTime,
}

#[derive(Debug)]
struct RoomState {
    members: HashSet<Uuid>,
    last_active: SystemTime,
}

impl RoomState {
    fn new() -> Self {
        Self {
            members: HashSet::new(),
            last_active: SystemTime::now(),
        }
    }
}

/// Room membership + bounded chat history, shared by all connection
/// handlers.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomState>>,
    chat: RwLock<HashMap<String, VecDeque<ChatMessage>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            chat: RwLock::new(HashMap::new()),
        }
    }

    /// Room ids come straight off the wire; reject ones that would make
    /// bad registry keys or unprintable log lines.
    pub fn validate_room_id(room_id: &str) -> Result<(), RelayError> {
        if room_id.is_empty() {
            return Err(RelayError::InvalidRoom("empty".into()));
        }
        if room_id.len() > MAX_ROOM_ID_BYTES {
            return Err(RelayError::InvalidRoom("too long".into()));
        }
        if room_id.chars().any(char::is_control) {
            return Err(RelayError::InvalidRoom("control characters".into()));
        }
        Ok(())
    }

    /// Add a session to a room, creating the room if needed. Updates the
    /// room's last-active time and returns the member count after the
    /// join.
    pub async fn join(&self, session_id: Uuid, room_id: &str) -> Result<usize, RelayError> {
        Self::validate_room_id(room_id)?;
        let mut rooms = self.rooms.write().await;
        let state = rooms
            .entry(room_id.to_string())
            .or_insert_with(RoomState::new);
        state.members.insert(session_id);
        state.last_active = SystemTime::now();
        Ok(state.members.len())
    }

    /// Remove a session from a room. Idempotent: leaving a room the
    /// session is not in (or that does not exist) is a no-op. When the
    /// last member leaves, the room and its chat history are deleted.
    /// Returns the remaining member count.
    pub async fn leave(&self, session_id: Uuid, room_id: &str) -> usize {
        let mut rooms = self.rooms.write().await;
        let remaining = match rooms.get_mut(room_id) {
            Some(state) => {
                state.members.remove(&session_id);
                state.last_active = SystemTime::now();
                state.members.len()
            }
            None => return 0,
        };
        if remaining == 0 {
            rooms.remove(room_id);
            drop(rooms);
            self.chat.write().await.remove(room_id);
            log::debug!("room {room_id} is now empty, history purged");
        }
        remaining
    }

    /// Current members of a room, sorted for deterministic fan-out and
    /// listing. Empty if the room does not exist.
    pub async fn members_of(&self, room_id: &str) -> Vec<Uuid> {
        let rooms = self.rooms.read().await;
        let mut members: Vec<Uuid> = rooms
            .get(room_id)
            .map(|s| s.members.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    /// All rooms ordered by member count descending, then most recent
    /// activity, then id ascending.
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let rooms = self.rooms.read().await;
        let mut infos: Vec<RoomInfo> = rooms
            .iter()
            .map(|(id, state)| RoomInfo {
                room_id: id.clone(),
                member_count: state.members.len(),
                last_active: state.last_active,
            })
            .collect();
        infos.sort_by(|a, b| {
            b.member_count
                .cmp(&a.member_count)
                .then_with(|| b.last_active.cmp(&a.last_active))
                .then_with(|| a.room_id.cmp(&b.room_id))
        });
        infos
    }

    /// Bump a room's last-active time (called on every broadcast).
    pub async fn touch(&self, room_id: &str) {
        if let Some(state) = self.rooms.write().await.get_mut(room_id) {
            state.last_active = SystemTime::now();
        }
    }

    /// Rooms a session currently belongs to.
    pub async fn rooms_of(&self, session_id: Uuid) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut ids: Vec<String> = rooms
            .iter()
            .filter(|(_, state)| state.members.contains(&session_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Remove a terminated session from every room it belongs to.
    ///
    /// Returns, per affected room, the remaining member set (sorted) so
    /// the relay can notify survivors. Emptied rooms are deleted along
    /// with their chat history.
    pub async fn drop_session(&self, session_id: Uuid) -> Vec<(String, Vec<Uuid>)> {
        let mut rooms = self.rooms.write().await;
        let mut affected = Vec::new();
        let mut emptied = Vec::new();
        for (id, state) in rooms.iter_mut() {
            if state.members.remove(&session_id) {
                state.last_active = SystemTime::now();
                let mut remaining: Vec<Uuid> = state.members.iter().copied().collect();
                remaining.sort_unstable();
                if remaining.is_empty() {
                    emptied.push(id.clone());
                }
                affected.push((id.clone(), remaining));
            }
        }
        for id in &emptied {
            rooms.remove(id);
        }
        drop(rooms);
        if !emptied.is_empty() {
            let mut chat = self.chat.write().await;
            for id in &emptied {
                chat.remove(id);
            }
        }
        affected.sort_by(|a, b| a.0.cmp(&b.0));
        affected
    }

    /// Append a chat message to the room's bounded history.
    pub async fn push_chat(&self, message: ChatMessage) {
        let mut chat = self.chat.write().await;
        let history = chat.entry(message.room_id.clone()).or_default();
        history.push_back(message);
        while history.len() > MAX_CHAT_MESSAGES_PER_ROOM {
            history.pop_front();
        }
    }

    /// Buffered chat history in insertion order (oldest first).
    pub async fn chat_history(&self, room_id: &str) -> Vec<ChatMessage> {
        let chat = self.chat.read().await;
        chat.get(room_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
