//! Deterministic merge of a remote element batch into a local replica.
//!
//! Every replica that applies the same set of element versions converges
//! on the same content, no matter how the updates were batched or in
//! which order they arrived. The merge is a pure function: no I/O, no
//! side effects, suitable for unit testing in isolation from transport.
//!
//! ```text
//! local Scene ──┐
//! remote batch ─┼── reconcile() ──► new Scene
//! protected ids ┘
//! ```
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::{HashMap, HashSet};

use crate::element::{Element, PositionKey, PositionedElement};
use crate::scene::Scene;

/// Merge `remote` into `local`, producing the new replica state.
///
/// Per-element resolution:
/// - ids under direct local manipulation (`protected`) keep the local
///   copy whenever its version is at least the remote's, so an
///   in-progress drag never visibly snaps;
/// - otherwise the strictly higher version wins, equal versions fall
///   back to the lower nonce, and a full tie keeps the local copy;
/// - ids unknown locally are accepted unconditionally.
///
/// Order reconstruction places each transmitted element by its
/// positioning key. When the referenced predecessor exists in neither
/// replica, an element that existed locally stays at its previous local
/// index and a new element is appended at the tail in batch order.
///
/// Tombstones (`deleted == true`) are carried into the result so stale
/// remote copies cannot resurrect them.
pub fn reconcile(
    local: &Scene,
    remote: &[PositionedElement],
    protected: &HashSet<String>,
) -> Scene {
    // Pass 1: resolve the winning copy per id.
    let mut merged: Vec<Element> = local.elements().to_vec();
    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.clone(), i))
        .collect();

    struct Placement {
        id: String,
        position: PositionKey,
        prior_index: Option<usize>,
    }
    let mut placements: Vec<Placement> = Vec::with_capacity(remote.len());

    for entry in remote {
        let id = entry.element.id.clone();
        let prior_index = local.index_of(&id);
        match index.get(&id) {
            Some(&i) => {
                if accept_remote(&merged[i], &entry.element, protected) {
                    merged[i] = entry.element.clone();
                }
            }
            None => {
                index.insert(id.clone(), merged.len());
                merged.push(entry.element.clone());
            }
        }
        placements.push(Placement {
            id,
            position: entry.position.clone(),
            prior_index,
        });
    }

    // Pass 2: rebuild total order from the positioning keys. Elements
    // absent from the batch keep their relative local order.
    let mut order: Vec<String> = merged.iter().map(|e| e.id.clone()).collect();
    for placement in &placements {
        if let Some(cur) = order.iter().position(|id| *id == placement.id) {
            order.remove(cur);
        }
        let at = match &placement.position {
            PositionKey::First => 0,
            PositionKey::After(pred) => match order.iter().position(|id| id == pred) {
                Some(pi) => pi + 1,
                // Predecessor unknown to both replicas: re-anchor at the
                // previous local position, or append new elements at the
                // tail in the order received.
                None => match placement.prior_index {
                    Some(i) => i.min(order.len()),
                    None => order.len(),
                },
            },
        };
        order.insert(at, placement.id.clone());
    }

    // Pass 3: materialize the ordered scene.
    let mut pool: HashMap<String, Element> =
        merged.into_iter().map(|e| (e.id.clone(), e)).collect();
    let elements = order.iter().filter_map(|id| pool.remove(id)).collect();
    Scene::from_elements(elements)
}

fn accept_remote(local: &Element, remote: &Element, protected: &HashSet<String>) -> bool {
    // Direct manipulation in progress wins over any remote copy the
    // manipulation could already have seen.
    if protected.contains(&local.id) && local.version >= remote.version {
        return false;
    }
    remote.supersedes(local)
}
