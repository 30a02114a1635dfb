//! The shared data unit of a drawing document and its versioning fields.
//!
//! Every replica resolves conflicts with the same rule: for a given id,
//! the copy with the strictly higher `version` is authoritative; on a
//! version tie the copy with the *lower* `version_nonce` wins. The nonce
//! is regenerated on every mutation, so two writers bumping the same
//! element to the same version still converge on one winner everywhere.
//!
//! Reference: Kleppmann, Chapter 5 — Replication (last-writer-wins)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single versioned drawable object.
///
/// Geometry and style live in `payload` and are carried through the sync
/// layer untouched; only the header fields participate in reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Stable identifier, assigned at creation, never reassigned.
    /// Editors mint these as opaque strings; the sync layer never parses them.
    pub id: String,
    /// Bumped on every local mutation by any writer. Starts at 1.
    pub version: u64,
    /// Regenerated on every mutation; breaks ties between equal versions.
    pub version_nonce: u64,
    /// Soft-delete flag. Tombstones stay in the scene until compacted.
    #[serde(default)]
    pub deleted: bool,
    /// Opaque geometry/style payload.
    #[serde(default)]
    pub payload: Value,
}

impl Element {
    /// Create a fresh element at version 1.
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            version: 1,
            version_nonce: fresh_nonce(),
            deleted: false,
            payload,
        }
    }

    /// Record a local mutation: bump the version and regenerate the nonce.
    pub fn bump_version(&mut self) {
        self.version += 1;
        self.version_nonce = fresh_nonce();
    }

    /// Soft-delete. The tombstone keeps propagating so stale remote
    /// copies cannot resurrect the element.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.bump_version();
    }

    /// Whether this copy is authoritative over `other` (same id assumed).
    ///
    /// Strictly higher version wins; on a tie the lower nonce wins. A
    /// full tie is not supersession, so the holder keeps its copy.
    pub fn supersedes(&self, other: &Element) -> bool {
        if self.version != other.version {
            return self.version > other.version;
        }
        self.version_nonce < other.version_nonce
    }
}

/// Generate a fresh version nonce from UUID entropy.
pub fn fresh_nonce() -> u64 {
    Uuid::new_v4().as_u128() as u64
}

/// Where a transmitted element must sit relative to the rest of the
/// scene. Array position of the batch carries no ordering meaning; this
/// key does, so a receiver can rebuild relative order from a subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionKey {
    /// Anchor at the head of the scene.
    First,
    /// Immediately after the element with this id.
    After(String),
}

/// One entry of a transmitted element batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionedElement {
    pub position: PositionKey,
    pub element: Element,
}

impl PositionedElement {
    pub fn new(position: PositionKey, element: Element) -> Self {
        Self { position, element }
    }

    /// Leniently decode one batch entry. Entries missing required fields
    /// (or with an empty id) yield `None` and are skipped by the caller.
    pub fn from_value(value: &Value) -> Option<Self> {
        let entry: PositionedElement = serde_json::from_value(value.clone()).ok()?;
        if entry.element.id.is_empty() {
            return None;
        }
        Some(entry)
    }
}

/// Encode a batch as the opaque JSON bytes the relay forwards verbatim.
pub fn encode_batch(batch: &[PositionedElement]) -> Vec<u8> {
    serde_json::to_vec(batch).unwrap_or_default()
}

/// Decode a received batch, skipping malformed entries.
///
/// One bad element must not block the rest of the room, so this never
/// errors: a payload that is not a JSON array decodes to an empty batch,
/// and individual undecodable entries are dropped.
pub fn decode_batch(payload: &[u8]) -> Vec<PositionedElement> {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(err) => {
            log::debug!("discarding undecodable element batch: {err}");
            return Vec::new();
        }
    };
    let entries = match value.as_array() {
        Some(entries) => entries,
        None => return Vec::new(),
    };
    let mut batch = Vec::with_capacity(entries.len());
    for entry in entries {
        match PositionedElement::from_value(entry) {
            Some(decoded) => batch.push(decoded),
            None => log::debug!("skipping malformed element in batch"),
        }
    }
    batch
}
