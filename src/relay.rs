//! Server-side CRDT document relay.
//!
//! Holds one authoritative [`yrs::Doc`] per canvas room, created lazily on
//! first join. The relay never interprets document content: updates are
//! decoded only to merge them, and the merged state is what late joiners
//! bootstrap from.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("update could not be applied: {0}")]
    ApplyFailed(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Extension point for durable room snapshots. The relay itself keeps
/// everything in memory; an implementation can write each merged update out
/// and seed freshly created rooms from storage.
pub trait RelayPersistence: Send + Sync {
    /// Called after every successfully merged update.
    fn persist(&self, room: &str, full_state: &[u8]) -> Result<(), RelayError>;
    /// Called when a room is first created. Returning `Some` seeds the doc
    /// with the encoded state.
    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, RelayError>;
}

/// Introspection snapshot for one room's document.
#[derive(Debug, Clone)]
pub struct RoomDocInfo {
    pub room: String,
    pub state_bytes: usize,
    pub has_content: bool,
}

/// All live canvas documents, keyed by room name.
pub struct CanvasRelay {
    docs: RwLock<HashMap<String, Arc<RwLock<Doc>>>>,
    persistence: Option<Arc<dyn RelayPersistence>>,
}

impl CanvasRelay {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            persistence: None,
        }
    }

    pub fn with_persistence(persistence: Arc<dyn RelayPersistence>) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            persistence: Some(persistence),
        }
    }

    async fn get_or_create(&self, room: &str) -> Result<Arc<RwLock<Doc>>, RelayError> {
        {
            let docs = self.docs.read().await;
            if let Some(doc) = docs.get(room) {
                return Ok(doc.clone());
            }
        }
        let mut docs = self.docs.write().await;
        if let Some(doc) = docs.get(room) {
            return Ok(doc.clone());
        }
        let doc = Doc::new();
        if let Some(ref persistence) = self.persistence {
            if let Some(state) = persistence.load(room)? {
                let update = Update::decode_v1(&state)
                    .map_err(|e| RelayError::MalformedUpdate(e.to_string()))?;
                let mut txn = doc.transact_mut();
                txn.apply_update(update)
                    .map_err(|e| RelayError::ApplyFailed(e.to_string()))?;
            }
        }
        let doc = Arc::new(RwLock::new(doc));
        docs.insert(room.to_string(), doc.clone());
        log::debug!("canvas doc for {room} created");
        Ok(doc)
    }

    /// Full encoded state of the room's document, creating it if needed.
    /// This is the late-joiner bootstrap payload.
    pub async fn join(&self, room: &str) -> Result<Vec<u8>, RelayError> {
        let doc = self.get_or_create(room).await?;
        let doc = doc.read().await;
        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Merge a client update into the room's document. Decode and apply
    /// failures are reported to the caller and leave the document untouched;
    /// other clients are unaffected.
    pub async fn apply_update(&self, room: &str, update: &[u8]) -> Result<(), RelayError> {
        let doc = self.get_or_create(room).await?;
        let doc = doc.write().await;
        // The decoded update is not Send; keep it confined between awaits.
        {
            let decoded = Update::decode_v1(update)
                .map_err(|e| RelayError::MalformedUpdate(e.to_string()))?;
            let mut txn = doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| RelayError::ApplyFailed(e.to_string()))?;
        }
        if let Some(ref persistence) = self.persistence {
            let state = {
                let txn = doc.transact();
                txn.encode_state_as_update_v1(&StateVector::default())
            };
            persistence.persist(room, &state)?;
        }
        Ok(())
    }

    /// Updates the requester is missing, relative to its state vector.
    pub async fn diff(&self, room: &str, state_vector: &[u8]) -> Result<Vec<u8>, RelayError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| RelayError::MalformedStateVector(e.to_string()))?;
        let doc = self.get_or_create(room).await?;
        let doc = doc.read().await;
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// State vector of the room's document, if the room exists.
    pub async fn state_vector(&self, room: &str) -> Option<Vec<u8>> {
        let doc = self.docs.read().await.get(room).cloned()?;
        let doc = doc.read().await;
        let txn = doc.transact();
        Some(txn.state_vector().encode_v1())
    }

    /// Drop the room's document. The caller decides when a room is empty.
    pub async fn remove(&self, room: &str) -> bool {
        let removed = self.docs.write().await.remove(room).is_some();
        if removed {
            log::debug!("canvas doc for {room} dropped");
        }
        removed
    }

    pub async fn room_count(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn info(&self, room: &str) -> Option<RoomDocInfo> {
        let doc = self.docs.read().await.get(room).cloned()?;
        let doc = doc.read().await;
        let txn = doc.transact();
        let state = txn.encode_state_as_update_v1(&StateVector::default());
        Some(RoomDocInfo {
            room: room.to_string(),
            // A pristine doc encodes to two zero bytes.
            has_content: state.len() > 2,
            state_bytes: state.len(),
        })
    }
}

impl Default for CanvasRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use yrs::{GetString, Text};

    fn update_inserting(text: &str) -> Vec<u8> {
        let doc = Doc::new();
        let field = doc.get_or_insert_text("scratch");
        let mut txn = doc.transact_mut();
        field.insert(&mut txn, 0, text);
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn text_of(state: &[u8]) -> String {
        let doc = Doc::new();
        let field = doc.get_or_insert_text("scratch");
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
        }
        let txn = doc.transact();
        field.get_string(&txn)
    }

    #[tokio::test]
    async fn test_join_creates_empty_doc() {
        let relay = CanvasRelay::new();
        let state = relay.join("canvas-g1").await.unwrap();
        assert!(!state.is_empty());
        assert_eq!(relay.room_count().await, 1);
        assert!(!relay.info("canvas-g1").await.unwrap().has_content);
    }

    #[tokio::test]
    async fn test_apply_then_join_returns_merged_state() {
        let relay = CanvasRelay::new();
        relay
            .apply_update("canvas-g1", &update_inserting("hello"))
            .await
            .unwrap();

        let state = relay.join("canvas-g1").await.unwrap();
        assert_eq!(text_of(&state), "hello");
        assert!(relay.info("canvas-g1").await.unwrap().has_content);
    }

    #[tokio::test]
    async fn test_malformed_update_rejected_and_doc_untouched() {
        let relay = CanvasRelay::new();
        relay
            .apply_update("canvas-g1", &update_inserting("keep"))
            .await
            .unwrap();

        let err = relay.apply_update("canvas-g1", &[0xFF, 0xFF]).await;
        assert!(matches!(err, Err(RelayError::MalformedUpdate(_))));

        let state = relay.join("canvas-g1").await.unwrap();
        assert_eq!(text_of(&state), "keep");
    }

    #[tokio::test]
    async fn test_diff_returns_missing_updates() {
        let relay = CanvasRelay::new();
        relay
            .apply_update("canvas-g1", &update_inserting("abc"))
            .await
            .unwrap();

        // Empty state vector: diff is the whole document.
        let empty_sv = StateVector::default().encode_v1();
        let diff = relay.diff("canvas-g1", &empty_sv).await.unwrap();
        assert_eq!(text_of(&diff), "abc");

        // Up-to-date state vector: nothing missing.
        let sv = relay.state_vector("canvas-g1").await.unwrap();
        let diff = relay.diff("canvas-g1", &sv).await.unwrap();
        assert_eq!(text_of(&diff), "");
    }

    #[tokio::test]
    async fn test_malformed_state_vector_rejected() {
        let relay = CanvasRelay::new();
        relay.join("canvas-g1").await.unwrap();
        let err = relay.diff("canvas-g1", &[0xFF]).await;
        assert!(matches!(err, Err(RelayError::MalformedStateVector(_))));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let relay = CanvasRelay::new();
        relay
            .apply_update("canvas-g1", &update_inserting("one"))
            .await
            .unwrap();
        relay.join("canvas-g2").await.unwrap();

        assert!(relay.info("canvas-g1").await.unwrap().has_content);
        assert!(!relay.info("canvas-g2").await.unwrap().has_content);
    }

    #[tokio::test]
    async fn test_remove_drops_doc() {
        let relay = CanvasRelay::new();
        relay.join("canvas-g1").await.unwrap();
        assert!(relay.remove("canvas-g1").await);
        assert!(!relay.remove("canvas-g1").await);
        assert_eq!(relay.room_count().await, 0);
    }

    struct MemPersistence {
        stored: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl RelayPersistence for MemPersistence {
        fn persist(&self, room: &str, full_state: &[u8]) -> Result<(), RelayError> {
            self.stored
                .lock()
                .unwrap()
                .insert(room.to_string(), full_state.to_vec());
            Ok(())
        }

        fn load(&self, room: &str) -> Result<Option<Vec<u8>>, RelayError> {
            Ok(self.stored.lock().unwrap().get(room).cloned())
        }
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let store = Arc::new(MemPersistence {
            stored: Mutex::new(HashMap::new()),
        });

        let relay = CanvasRelay::with_persistence(store.clone());
        relay
            .apply_update("canvas-g1", &update_inserting("saved"))
            .await
            .unwrap();
        relay.remove("canvas-g1").await;

        // A fresh relay backed by the same store seeds the room from it.
        let relay = CanvasRelay::with_persistence(store);
        let state = relay.join("canvas-g1").await.unwrap();
        assert_eq!(text_of(&state), "saved");
    }
}
