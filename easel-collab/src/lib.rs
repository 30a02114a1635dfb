//! # easel-collab — Real-time collaboration layer for Easel
//!
//! Provides WebSocket-based multiplayer drawing using room-scoped
//! broadcast relay. The server never interprets scene content; clients
//! reconcile remote batches locally with [`easel_core::reconcile`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per user)   │     Binary Proto    │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ Scene        │                     │ RoomRegistry │
//! │ (reconciled) │                     │ (membership) │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                     ┌───────┴────────┐
//!                                     │ BroadcastRelay │
//!                                     │ (fan-out)      │
//!                                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded request/event enums)
//! - [`registry`] — Room membership and bounded chat history
//! - [`relay`] — Durable/volatile fan-out over per-session queues
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client emitting [`CollabEvent`]s
//! - [`store`] — Pluggable document persistence boundary

pub mod client;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use client::{CollabClient, CollabEvent, ConnectionState};
pub use protocol::{
    AckStatus, BroadcastResult, ChatMessage, ClientMessage, DeliveryClass, ProtocolError,
    RelayError, ServerMessage,
};
pub use registry::{RoomInfo, RoomRegistry, MAX_CHAT_MESSAGES_PER_ROOM};
pub use relay::{BroadcastRelay, RelayStats};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use store::{Document, DocumentStore, MemoryStore, StoreError};
