//! Client-side collaborative canvas document.
//!
//! Elements live in one Y.Map named `elements`, keyed by element id, each
//! value a JSON-serialized [`CanvasElement`]. Concurrent edits to different
//! elements merge cleanly; concurrent writes to the same element resolve to
//! one winner by CRDT rules.
//!
//! Local mutations capture the state vector before the change and return the
//! encoded delta, so the caller can ship exactly that mutation without
//! observer plumbing.
//!
//! Awareness (cursors, tools) is deliberately outside the CRDT: it is a
//! last-writer-wins map that is never merged, only overwritten per user.

use std::collections::HashMap;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Map, MapRef, ReadTxn, StateVector, Transact, Update};

use crate::protocol::{now_millis, CanvasAwareness, CanvasElement};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("element serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("update could not be applied: {0}")]
    ApplyFailed(String),
}

/// What an incoming awareness state meant for the peer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessEvent {
    Joined,
    Updated,
}

pub struct CanvasDocument {
    doc: Doc,
    elements: MapRef,
    awareness: HashMap<String, CanvasAwareness>,
}

impl CanvasDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let elements = doc.get_or_insert_map("elements");
        Self {
            doc,
            elements,
            awareness: HashMap::new(),
        }
    }

    /// Insert or replace an element, returning the encoded delta for peers.
    pub fn put_element(&mut self, element: &CanvasElement) -> Result<Vec<u8>, DocumentError> {
        let json = serde_json::to_string(element)?;
        let mut txn = self.doc.transact_mut();
        let sv_before = txn.state_vector();
        self.elements.insert(&mut txn, element.id.clone(), json);
        Ok(txn.encode_state_as_update_v1(&sv_before))
    }

    /// Merge property changes into an existing element and bump its
    /// `updated_at`. Returns `None` if the id is unknown.
    pub fn update_element(
        &mut self,
        id: &str,
        changes: HashMap<String, serde_json::Value>,
    ) -> Result<Option<Vec<u8>>, DocumentError> {
        let Some(mut current) = self.element(id) else {
            return Ok(None);
        };
        current.properties.extend(changes);
        current.updated_at = now_millis();
        self.put_element(&current).map(Some)
    }

    /// Remove an element. Returns `None` if the id is unknown.
    pub fn remove_element(&mut self, id: &str) -> Result<Option<Vec<u8>>, DocumentError> {
        let mut txn = self.doc.transact_mut();
        let sv_before = txn.state_vector();
        if self.elements.remove(&mut txn, id).is_none() {
            return Ok(None);
        }
        Ok(Some(txn.encode_state_as_update_v1(&sv_before)))
    }

    /// Merge a remote delta or a full-state bootstrap. Both are plain
    /// updates; the CRDT makes the merge idempotent and order-insensitive.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<(), DocumentError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| DocumentError::ApplyFailed(e.to_string()))
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    pub fn full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    pub fn element(&self, id: &str) -> Option<CanvasElement> {
        let txn = self.doc.transact();
        let value = self.elements.get(&txn, id)?;
        serde_json::from_str(&value.to_string(&txn)).ok()
    }

    /// All elements, ordered by layer then creation time for stable
    /// rendering.
    pub fn elements(&self) -> Vec<CanvasElement> {
        let txn = self.doc.transact();
        let mut out: Vec<CanvasElement> = self
            .elements
            .iter(&txn)
            .filter_map(|(_, value)| serde_json::from_str(&value.to_string(&txn)).ok())
            .collect();
        out.sort_by(|a, b| {
            a.layer
                .cmp(&b.layer)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        out
    }

    pub fn element_count(&self) -> usize {
        let txn = self.doc.transact();
        self.elements.len(&txn) as usize
    }

    /// Record the local user's own awareness, so `connected_users` counts
    /// self like any peer.
    pub fn set_local_awareness(&mut self, user_id: &str, state: CanvasAwareness) {
        self.awareness.insert(user_id.to_string(), state);
    }

    /// Apply a peer's awareness state. New keys are joins, known keys are
    /// updates; the distinction is derived here, not carried on the wire.
    pub fn apply_awareness(&mut self, user_id: &str, state: CanvasAwareness) -> AwarenessEvent {
        let event = if self.awareness.contains_key(user_id) {
            AwarenessEvent::Updated
        } else {
            AwarenessEvent::Joined
        };
        self.awareness.insert(user_id.to_string(), state);
        event
    }

    pub fn remove_awareness(&mut self, user_id: &str) -> Option<CanvasAwareness> {
        self.awareness.remove(user_id)
    }

    pub fn awareness_of(&self, user_id: &str) -> Option<&CanvasAwareness> {
        self.awareness.get(user_id)
    }

    pub fn connected_users(&self) -> Vec<String> {
        self.awareness.keys().cloned().collect()
    }

    /// Drop awareness entries not refreshed within `threshold_ms`.
    pub fn prune_awareness_at(&mut self, now_ms: u64, threshold_ms: u64) -> Vec<String> {
        let stale: Vec<String> = self
            .awareness
            .iter()
            .filter(|(_, a)| now_ms.saturating_sub(a.last_seen) > threshold_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.awareness.remove(id);
        }
        stale
    }
}

impl Default for CanvasDocument {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{now_millis, CursorPos};

    fn element(id: &str, layer: i64) -> CanvasElement {
        CanvasElement {
            id: id.to_string(),
            element_type: "rect".to_string(),
            position: CursorPos::new(10.0, 20.0),
            properties: HashMap::from([(
                "fill".to_string(),
                serde_json::Value::String("red".to_string()),
            )]),
            layer,
            created_by: "u1".to_string(),
            created_at: now_millis(),
            updated_at: now_millis(),
        }
    }

    #[test]
    fn test_put_and_read_element() {
        let mut doc = CanvasDocument::new();
        let el = element("e1", 0);
        let update = doc.put_element(&el).unwrap();
        assert!(!update.is_empty());

        let read = doc.element("e1").unwrap();
        assert_eq!(read, el);
        assert_eq!(doc.element_count(), 1);
    }

    #[test]
    fn test_update_merges_properties_and_bumps_updated_at() {
        let mut doc = CanvasDocument::new();
        let changes = HashMap::from([(
            "stroke".to_string(),
            serde_json::Value::String("black".to_string()),
        )]);
        assert!(doc.update_element("e1", changes.clone()).unwrap().is_none());

        let mut el = element("e1", 0);
        el.updated_at = 0;
        doc.put_element(&el).unwrap();
        assert!(doc.update_element("e1", changes).unwrap().is_some());

        let updated = doc.element("e1").unwrap();
        assert_eq!(updated.properties["fill"], "red");
        assert_eq!(updated.properties["stroke"], "black");
        assert!(updated.updated_at > 0);
    }

    #[test]
    fn test_remove_element() {
        let mut doc = CanvasDocument::new();
        doc.put_element(&element("e1", 0)).unwrap();

        assert!(doc.remove_element("ghost").unwrap().is_none());
        let update = doc.remove_element("e1").unwrap().unwrap();
        assert!(!update.is_empty());
        assert_eq!(doc.element_count(), 0);
    }

    #[test]
    fn test_deltas_propagate_between_peers() {
        let mut a = CanvasDocument::new();
        let mut b = CanvasDocument::new();

        let update = a.put_element(&element("e1", 0)).unwrap();
        b.apply_update(&update).unwrap();

        assert_eq!(b.element("e1"), a.element("e1"));
    }

    #[test]
    fn test_concurrent_updates_commute() {
        let mut a = CanvasDocument::new();
        let mut b = CanvasDocument::new();

        let ua = a.put_element(&element("ea", 0)).unwrap();
        let ub = b.put_element(&element("eb", 1)).unwrap();

        // Apply in opposite orders; both replicas converge.
        let mut c = CanvasDocument::new();
        c.apply_update(&ua).unwrap();
        c.apply_update(&ub).unwrap();

        let mut d = CanvasDocument::new();
        d.apply_update(&ub).unwrap();
        d.apply_update(&ua).unwrap();

        assert_eq!(c.elements(), d.elements());
        assert_eq!(c.element_count(), 2);
    }

    #[test]
    fn test_late_joiner_bootstraps_from_full_state() {
        let mut a = CanvasDocument::new();
        a.put_element(&element("e1", 2)).unwrap();
        a.put_element(&element("e2", 1)).unwrap();

        let mut late = CanvasDocument::new();
        late.apply_update(&a.full_state()).unwrap();

        assert_eq!(late.elements(), a.elements());
    }

    #[test]
    fn test_elements_ordered_by_layer() {
        let mut doc = CanvasDocument::new();
        doc.put_element(&element("top", 5)).unwrap();
        doc.put_element(&element("bottom", 1)).unwrap();

        let elements = doc.elements();
        let ids: Vec<&str> = elements.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["bottom", "top"]);
    }

    #[test]
    fn test_malformed_update_rejected() {
        let mut doc = CanvasDocument::new();
        assert!(matches!(
            doc.apply_update(&[0xFF, 0xFF, 0xFF]),
            Err(DocumentError::MalformedUpdate(_))
        ));
    }

    #[test]
    fn test_awareness_join_update_leave() {
        let mut doc = CanvasDocument::new();
        let state = CanvasAwareness::new("u1", "Alice");

        assert_eq!(doc.apply_awareness("u1", state.clone()), AwarenessEvent::Joined);
        assert_eq!(doc.apply_awareness("u1", state), AwarenessEvent::Updated);
        assert_eq!(doc.connected_users(), vec!["u1".to_string()]);

        assert!(doc.remove_awareness("u1").is_some());
        assert!(doc.connected_users().is_empty());
    }

    #[test]
    fn test_awareness_prune_stale() {
        let mut doc = CanvasDocument::new();
        let mut state = CanvasAwareness::new("u1", "Alice");
        state.last_seen = 1_000;
        doc.apply_awareness("u1", state);

        assert!(doc.prune_awareness_at(30_000, 60_000).is_empty());
        assert_eq!(doc.prune_awareness_at(62_000, 60_000), vec!["u1".to_string()]);
        assert!(doc.awareness_of("u1").is_none());
    }
}
