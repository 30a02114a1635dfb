//! Typed wire protocol between sync clients and the room relay.
//!
//! Every request a client can make and every event the relay can push
//! is a variant of one of two bincode-encoded enums, and every request
//! is answered with the same fixed [`BroadcastResult`] shape. There is
//! no variable-arity acknowledgement and no runtime type inspection:
//! the contract is closed at compile time.
//!
//! Element batches travel as opaque JSON bytes inside the envelope; the
//! relay forwards them verbatim and never inspects their content.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reliability class of a broadcast (§ durable vs volatile).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryClass {
    /// Delivered to every other current room member; losing these would
    /// break convergence. Document-changing edits use this class.
    Durable,
    /// Best-effort; silently dropped under load. Pointer positions and
    /// other ephemeral signals use this class.
    Volatile,
}

/// A single chat message buffered in a room's bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub sender: Uuid,
    pub content: String,
    pub timestamp_ms: u64,
}

impl ChatMessage {
    pub fn new(
        id: impl Into<String>,
        room_id: impl Into<String>,
        sender: Uuid,
        content: impl Into<String>,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            id: id.into(),
            room_id: room_id.into(),
            sender,
            content: content.into(),
            timestamp_ms,
        }
    }
}

/// Requests sent from a client session to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
    Broadcast {
        room_id: String,
        class: DeliveryClass,
        /// Opaque element batch (JSON bytes), forwarded verbatim.
        payload: Vec<u8>,
        /// Free-form metadata, e.g. pointer info for volatile broadcasts.
        metadata: Vec<u8>,
        /// Caller-supplied correlation id echoed back in the ack.
        message_id: Option<String>,
    },
    Chat {
        room_id: String,
        message_id: String,
        content: String,
    },
}

/// Events pushed from the relay to client sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// First frame on every connection: the server-assigned session id.
    SessionInit { session_id: Uuid },
    /// The joining session is alone in the room and owns initial state.
    FirstInRoom { room_id: String },
    /// A new session joined; sent to the pre-existing members only.
    NewUser { room_id: String, session_id: Uuid },
    /// Full member list; sent to all members on every membership change.
    RoomUserChange { room_id: String, members: Vec<Uuid> },
    /// A broadcast from another member of the room (never echoed back).
    ClientBroadcast {
        room_id: String,
        payload: Vec<u8>,
        metadata: Vec<u8>,
    },
    /// Buffered chat history, replayed to a newly joined session only.
    ChatHistory {
        room_id: String,
        messages: Vec<ChatMessage>,
    },
    /// A live chat message, delivered to all members including the sender.
    ChatBroadcast(ChatMessage),
    /// Typed acknowledgement for the preceding request.
    Ack(BroadcastResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Ok,
    Error,
}

/// Fixed request/response contract for acknowledgements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub status: AckStatus,
    pub error: Option<String>,
    /// Correlation id supplied by the caller, echoed back unchanged.
    pub message_id: Option<String>,
    /// Member count after a successful join.
    pub member_count: Option<usize>,
}

impl BroadcastResult {
    pub fn ok(message_id: Option<String>) -> Self {
        Self {
            status: AckStatus::Ok,
            error: None,
            message_id,
            member_count: None,
        }
    }

    pub fn joined(member_count: usize) -> Self {
        Self {
            status: AckStatus::Ok,
            error: None,
            message_id: None,
            member_count: Some(member_count),
        }
    }

    pub fn failure(error: impl Into<String>, message_id: Option<String>) -> Self {
        Self {
            status: AckStatus::Error,
            error: Some(error.into()),
            message_id,
            member_count: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }
}

/// Errors raised by the registry and relay (§ error taxonomy).
///
/// These are returned synchronously to the calling session as an ack
/// failure; none of them is fatal to the server process.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Empty or malformed room id on join or broadcast.
    InvalidRoom(String),
    /// Broadcast missing required fields or exceeding size limits.
    MalformedPayload(String),
    /// The relay could not reach the transport for fan-out (aggregate,
    /// never per-recipient).
    DeliveryFailure(String),
    /// Operation referencing a session the relay is not tracking.
    UnknownSession(Uuid),
    /// The relay is draining and refuses new sessions and joins.
    ShuttingDown,
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRoom(reason) => write!(f, "invalid room id: {reason}"),
            Self::MalformedPayload(reason) => write!(f, "malformed payload: {reason}"),
            Self::DeliveryFailure(reason) => write!(f, "delivery failure: {reason}"),
            Self::UnknownSession(id) => write!(f, "unknown session {id}"),
            Self::ShuttingDown => write!(f, "relay is shutting down"),
        }
    }
}

impl std::error::Error for RelayError {}

/// Wire codec errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

impl ServerMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}
