//! Persistence boundary for saved drawings.
//!
//! The relay never reads or writes documents; it only forwards bytes.
//! Persistence is a separate collaborator behind the [`DocumentStore`]
//! trait, which the server can optionally hold. The bundled
//! [`MemoryStore`] keeps documents in a process-local map and is mainly
//! useful for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use uuid::Uuid;

/// A saved drawing: opaque serialized bytes under a store-issued id.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Vec<u8>,
    pub created_at: SystemTime,
}

/// Store failures.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// No document under the requested id.
    NotFound(String),
    /// The backing store failed.
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "document not found: {id}"),
            Self::Backend(reason) => write!(f, "store backend error: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Pluggable document persistence.
///
/// `save` mints and returns a new id on every call; documents are
/// immutable once stored.
pub trait DocumentStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Document, StoreError>;
    fn save(&self, data: Vec<u8>) -> Result<String, StoreError>;
}

/// In-memory store backed by a mutexed map.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, id: &str) -> Result<Document, StoreError> {
        let documents = self
            .documents
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        documents
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn save(&self, data: Vec<u8>) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let document = Document {
            id: id.clone(),
            data,
            created_at: SystemTime::now(),
        };
        let mut documents = self
            .documents
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        documents.insert(id.clone(), document);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::{encode_batch, Element, Scene};
    use serde_json::json;

    #[test]
    fn test_save_then_load() {
        let store = MemoryStore::new();
        let id = store.save(vec![1, 2, 3]).unwrap();
        let doc = store.load(&id).unwrap();
        assert_eq!(doc.id, id);
        assert_eq!(doc.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let store = MemoryStore::new();
        assert_eq!(
            store.load("nope"),
            Err(StoreError::NotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_each_save_mints_fresh_id() {
        let store = MemoryStore::new();
        let a = store.save(vec![1]).unwrap();
        let b = store.save(vec![1]).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_tombstones_compacted_before_save() {
        // Deleted elements stay in the live scene for convergence but
        // are stripped from the persisted copy.
        let mut scene = Scene::from_elements(vec![
            Element::new("a", json!({"kind": "rect"})),
            Element::new("b", json!({"kind": "line"})),
        ]);
        scene.mark_deleted("b");

        let mut snapshot = scene.clone();
        let removed = snapshot.compact();
        assert_eq!(removed, 1);

        let store = MemoryStore::new();
        let id = store.save(encode_batch(&snapshot.to_batch())).unwrap();

        let doc = store.load(&id).unwrap();
        let restored = easel_core::decode_batch(&doc.data);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].element.id, "a");

        // The live scene still carries the tombstone.
        assert_eq!(scene.len(), 2);
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(
            StoreError::NotFound("d1".into()).to_string(),
            "document not found: d1"
        );
        assert!(StoreError::Backend("lock poisoned".into())
            .to_string()
            .contains("lock poisoned"));
    }
}
