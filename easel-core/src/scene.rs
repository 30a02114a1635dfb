//! The ordered collection of elements making up one document replica.
//!
//! Order is paint order (z-order) and carries semantic meaning. Each
//! replica owns its `Scene` exclusively; everything crossing the process
//! boundary travels by value as an encoded batch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::element::{Element, PositionKey, PositionedElement};

/// One document's current state: elements in paint order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    elements: Vec<Element>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements(elements: Vec<Element>) -> Self {
        Self { elements }
    }

    /// All elements, tombstones included, in paint order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Elements that are not soft-deleted.
    pub fn live(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|e| !e.deleted)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }

    /// Lookup table of id → element for callers doing repeated lookups.
    pub fn by_id(&self) -> HashMap<&str, &Element> {
        self.elements.iter().map(|e| (e.id.as_str(), e)).collect()
    }

    /// Local edit path: replace the element with the same id in place,
    /// or append it to the top of the paint order.
    pub fn upsert(&mut self, element: Element) {
        match self.index_of(&element.id) {
            Some(i) => self.elements[i] = element,
            None => self.elements.push(element),
        }
    }

    /// Soft-delete by id. Returns false if the id is unknown.
    pub fn mark_deleted(&mut self, id: &str) -> bool {
        match self.elements.iter_mut().find(|e| e.id == id) {
            Some(el) => {
                el.mark_deleted();
                true
            }
            None => false,
        }
    }

    /// Export the whole scene as a transmitted batch: the head element is
    /// anchored `First`, every other element follows its predecessor.
    pub fn to_batch(&self) -> Vec<PositionedElement> {
        let mut batch = Vec::with_capacity(self.elements.len());
        let mut prev: Option<&str> = None;
        for element in &self.elements {
            let position = match prev {
                None => PositionKey::First,
                Some(p) => PositionKey::After(p.to_string()),
            };
            batch.push(PositionedElement::new(position, element.clone()));
            prev = Some(element.id.as_str());
        }
        batch
    }

    /// Physically remove tombstones.
    ///
    /// Tombstones must survive in the live scene so a stale remote copy
    /// cannot resurrect a deleted element; the save path compacts a clone
    /// right before persisting. Returns the number of removed elements.
    pub fn compact(&mut self) -> usize {
        let before = self.elements.len();
        self.elements.retain(|e| !e.deleted);
        before - self.elements.len()
    }
}
