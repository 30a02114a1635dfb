//! # easel-core — shared document model for easel collaboration
//!
//! The data types and merge logic every replica agrees on:
//!
//! ```text
//! remote batch (opaque JSON bytes)
//!        │ decode_batch()        skips malformed entries
//!        ▼
//! Vec<PositionedElement> ──┐
//! local Scene ─────────────┼── reconcile() ──► new Scene
//! protection set ──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`element`] — versioned `Element`, positioning keys, batch codec
//! - [`scene`] — ordered replica state, tombstones, compaction
//! - [`reconcile`] — deterministic last-writer-wins merge
//!
//! No I/O and no async anywhere in this crate: a reconciliation pass is
//! synchronous and runs to completion on the caller's event queue.

pub mod element;
pub mod reconcile;
pub mod scene;

// Re-exports for convenience
pub use element::{
    decode_batch, encode_batch, fresh_nonce, Element, PositionKey, PositionedElement,
};
pub use reconcile::reconcile;
pub use scene::Scene;
