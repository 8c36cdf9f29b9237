//! Room-scoped fan-out with backpressure.
//!
//! Every room (group or canvas) owns one tokio broadcast channel; each
//! member holds an independent receiver buffering up to `capacity` frames.
//! Frames are tagged with the originating user so receivers can skip their
//! own traffic. Nothing is ever addressed server-wide; routing is confined
//! to the room's subscriber set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerFrame};

/// A frame in flight inside one room.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    /// User whose action produced this frame; receivers skip their own.
    /// `None` marks server-originated frames delivered to everyone.
    pub origin: Option<String>,
    pub bytes: Arc<Vec<u8>>,
}

/// A member registered in a room. Membership is per connection, not per
/// user: a user whose new socket supersedes an old one is briefly present
/// twice, and the old socket's removal must not touch the new entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomMember {
    /// Connection that registered this membership; guards its removal.
    pub conn_id: Uuid,
    pub user_id: String,
    pub user_name: String,
}

/// Fan-out statistics for one room.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub members: usize,
}

/// One room's broadcast channel and membership.
pub struct Room {
    sender: broadcast::Sender<RoomFrame>,
    members: RwLock<HashMap<Uuid, RoomMember>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl Room {
    /// `capacity` bounds how many frames a lagging member may buffer before
    /// it starts dropping (backpressure).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a member and hand back its receiver. Rejoining replaces the
    /// previous registration for the same connection.
    pub async fn join(&self, member: RoomMember) -> broadcast::Receiver<RoomFrame> {
        let mut members = self.members.write().await;
        members.insert(member.conn_id, member);
        self.sender.subscribe()
    }

    /// Remove the membership registered by `conn_id`. A connection can only
    /// remove its own registration, never a successor's.
    pub async fn leave(&self, conn_id: Uuid) -> Option<RoomMember> {
        self.members.write().await.remove(&conn_id)
    }

    /// Publish pre-encoded bytes to every member. Lock-free hot path.
    /// Returns the number of live receivers.
    pub fn publish(&self, origin: Option<&str>, bytes: Arc<Vec<u8>>) -> usize {
        let frame = RoomFrame {
            origin: origin.map(str::to_string),
            bytes,
        };
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Encode and publish a server frame.
    pub fn publish_frame(
        &self,
        origin: Option<&str>,
        frame: &ServerFrame,
    ) -> Result<usize, ProtocolError> {
        let bytes = frame.encode()?;
        Ok(self.publish(origin, Arc::new(bytes)))
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<RoomMember> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, user_id: &str) -> bool {
        self.members
            .read()
            .await
            .values()
            .any(|m| m.user_id == user_id)
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw subscription without membership (monitoring, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<RoomFrame> {
        self.sender.subscribe()
    }
}

/// Maps room names to rooms, creating lazily on first use.
///
/// Group rooms are keyed by the internal `group:{id}` name, canvas rooms by
/// their client-supplied `canvas-…` name, so the two namespaces cannot
/// collide.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    default_capacity: usize,
}

/// Internal room name for a group.
pub fn group_room_name(group_id: &str) -> String {
    format!("group:{group_id}")
}

impl RoomRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        let room = Arc::new(Room::new(self.default_capacity));
        rooms.insert(name.to_string(), room.clone());
        log::debug!("room {name} created");
        room
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Drop the room if it has no members. Returns whether it was removed.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            if room.member_count().await == 0 {
                rooms.remove(name);
                log::debug!("room {name} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Member count of a room, 0 if the room does not exist.
    pub async fn member_count(&self, name: &str) -> usize {
        match self.get(name).await {
            Some(room) => room.member_count().await,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> RoomMember {
        RoomMember {
            conn_id: Uuid::new_v4(),
            user_id: id.to_string(),
            user_name: id.to_uppercase(),
        }
    }

    #[tokio::test]
    async fn test_room_join_leave() {
        let room = Room::new(16);
        let m = member("u1");
        let conn = m.conn_id;
        let _rx = room.join(m).await;
        assert_eq!(room.member_count().await, 1);
        assert!(room.has_member("u1").await);

        room.leave(conn).await;
        assert_eq!(room.member_count().await, 0);
        assert!(!room.has_member("u1").await);
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_evict_successor() {
        let room = Room::new(16);
        let old = member("u1");
        let old_conn = old.conn_id;
        let _rx_old = room.join(old).await;
        // Same user on a new connection; the old entry lingers until its
        // socket tears down.
        let _rx_new = room.join(member("u1")).await;
        assert_eq!(room.member_count().await, 2);

        room.leave(old_conn).await;
        assert_eq!(room.member_count().await, 1);
        assert!(room.has_member("u1").await, "successor membership must survive");
    }

    #[tokio::test]
    async fn test_publish_reaches_all_receivers() {
        let room = Room::new(16);
        let mut rx1 = room.join(member("u1")).await;
        let mut rx2 = room.join(member("u2")).await;

        let count = room
            .publish_frame(Some("u1"), &ServerFrame::HeartbeatAck)
            .unwrap();
        assert_eq!(count, 2);

        let f1 = rx1.recv().await.unwrap();
        let f2 = rx2.recv().await.unwrap();
        assert_eq!(f1.origin.as_deref(), Some("u1"));
        assert_eq!(f1.bytes, f2.bytes);
    }

    #[tokio::test]
    async fn test_publish_raw_bytes() {
        let room = Room::new(16);
        let mut rx = room.join(member("u1")).await;
        let payload = Arc::new(vec![9u8, 8, 7]);
        assert_eq!(room.publish(None, payload.clone()), 1);
        let frame = rx.recv().await.unwrap();
        assert!(frame.origin.is_none());
        assert_eq!(*frame.bytes, vec![9u8, 8, 7]);
    }

    #[tokio::test]
    async fn test_room_stats() {
        let room = Room::new(16);
        let _rx = room.join(member("u1")).await;
        room.publish(None, Arc::new(vec![1]));
        room.publish(None, Arc::new(vec![2]));
        let stats = room.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.members, 1);
    }

    #[tokio::test]
    async fn test_registry_get_or_create_is_idempotent() {
        let registry = RoomRegistry::new(16);
        let a = registry.get_or_create("group:g1").await;
        let b = registry.get_or_create("group:g1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_isolation_between_rooms() {
        let registry = RoomRegistry::new(16);
        let g1 = registry.get_or_create("group:g1").await;
        let g2 = registry.get_or_create("group:g2").await;

        let mut rx1 = g1.join(member("u1")).await;
        let _rx2 = g2.join(member("u2")).await;

        g2.publish(None, Arc::new(vec![1, 2, 3]));

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx1.recv()).await;
        assert!(result.is_err(), "room g1 must not see g2 traffic");
    }

    #[tokio::test]
    async fn test_registry_remove_if_empty() {
        let registry = RoomRegistry::new(16);
        let room = registry.get_or_create("canvas-g1").await;
        let m = member("u1");
        let conn = m.conn_id;
        let _rx = room.join(m).await;

        assert!(!registry.remove_if_empty("canvas-g1").await);
        room.leave(conn).await;
        assert!(registry.remove_if_empty("canvas-g1").await);
        assert_eq!(registry.room_count().await, 0);
    }

    #[test]
    fn test_group_room_name() {
        assert_eq!(group_room_name("g1"), "group:g1");
    }
}
