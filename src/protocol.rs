//! Typed wire protocol for the realtime layer.
//!
//! Every frame that crosses the connection is a member of one of two
//! bincode-encoded unions: [`ClientFrame`] (client → server) and
//! [`ServerFrame`] (server → client, or client-local notification). There is
//! no string-keyed event dispatch anywhere; unknown events cannot exist on
//! the wire, and kinds with no registered handler are dropped by the
//! dispatcher.
//!
//! Logical event taxonomy carried by these frames:
//!
//! | Frame | Original event name |
//! |---|---|
//! | `PresenceUpdate` / `PresenceUpdated` | `presence:update` / `presence:updated` |
//! | `GroupJoin` / `GroupLeave` | `group:join` / `group:leave` |
//! | `GroupPresence` | `group:presence` |
//! | `UserJoined` / `UserLeft` / `UserInactive` | `user:joined` / `user:left` / `user:inactive` |
//! | `CursorUpdate` → `CursorUpdated` | `cursor:update` → `cursor:updated` |
//! | `ToolChange` → `ToolChanged` | `tool:change` → `tool:changed` |
//! | `Heartbeat` → `HeartbeatAck` | `heartbeat` → `heartbeat:ack` |
//! | `CanvasJoin` / `CanvasLeave` | `yjs:join-room` / `yjs:leave-room` |
//! | `DocSyncRequest` / `DocState` | `yjs:sync-step1` / `yjs:sync-step2` |
//! | `DocUpdate` | `yjs:update` |
//! | `Awareness` | `yjs:awareness` |
//! | `DocError` | `yjs:error` |
//! | `ConnectionStatus` | `connection:status` (client-local) |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Canvas room names must carry this prefix; anything else is rejected
/// with a `DocError` before touching the relay.
pub const CANVAS_ROOM_PREFIX: &str = "canvas-";

/// Milliseconds since the Unix epoch. Wall-clock timestamps on the wire are
/// carried as integers so frames stay comparable across peers.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid canvas room name: {0:?}")]
    InvalidRoomName(String),
}

/// Check a canvas room name against the required prefix convention.
pub fn validate_canvas_room(name: &str) -> Result<(), ProtocolError> {
    if name.starts_with(CANVAS_ROOM_PREFIX) && name.len() > CANVAS_ROOM_PREFIX.len() {
        Ok(())
    } else {
        Err(ProtocolError::InvalidRoomName(name.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Data model
// ───────────────────────────────────────────────────────────────────

/// Connection lifecycle phases of the client-side state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Observable client connection state. Owned by exactly one
/// `ConnectionMachine` per client; nothing else mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    /// Millis since epoch of the most recent successful connect.
    pub last_connected: Option<u64>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
            last_connected: None,
        }
    }
}

/// Cursor position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPos {
    pub x: f64,
    pub y: f64,
}

impl CursorPos {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One user's liveness/location entry in the server presence store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: String,
    pub user_name: String,
    pub group_id: Option<String>,
    pub cursor: Option<CursorPos>,
    pub is_active: bool,
    pub current_tool: Option<String>,
    /// Millis since epoch; advanced by heartbeats and any presence activity.
    pub last_seen: u64,
}

impl UserPresence {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            group_id: None,
            cursor: None,
            is_active: true,
            current_tool: None,
            last_seen: now_millis(),
        }
    }
}

/// Partial presence update; unset fields leave the stored entry untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresencePatch {
    pub cursor: Option<CursorPos>,
    pub current_tool: Option<String>,
    pub is_active: Option<bool>,
}

/// Ephemeral per-user record for a canvas room. Last write per user wins;
/// never merged through the CRDT and never part of document history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasAwareness {
    pub user_name: String,
    pub cursor: Option<CursorPos>,
    pub current_tool: Option<String>,
    /// RGBA, stable per user.
    pub color: [f32; 4],
    pub last_seen: u64,
}

impl CanvasAwareness {
    pub fn new(user_id: &str, user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            cursor: None,
            current_tool: None,
            color: color_for_user(user_id),
            last_seen: now_millis(),
        }
    }
}

/// Stable RGBA color derived from the user id, so every peer renders the
/// same user in the same color without coordination.
pub fn color_for_user(user_id: &str) -> [f32; 4] {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    let hash = hasher.finish();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// An element of the shared canvas document. Lives as a JSON value inside
/// the per-room CRDT element map; the map key is `id` and is never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasElement {
    pub id: String,
    pub element_type: String,
    pub position: CursorPos,
    pub properties: HashMap<String, serde_json::Value>,
    pub layer: i64,
    pub created_by: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl CanvasElement {
    pub fn new(
        id: impl Into<String>,
        element_type: impl Into<String>,
        position: CursorPos,
        layer: i64,
        created_by: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            element_type: element_type.into(),
            position,
            properties: HashMap::new(),
            layer,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire frames
// ───────────────────────────────────────────────────────────────────

/// Frames sent by a client over the wire.
///
/// `Authenticate` must be the first frame on every connection; the server
/// rejects anything else before a validated identity exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    Authenticate { token: String },
    PresenceUpdate { patch: PresencePatch },
    GroupJoin { group_id: String },
    GroupLeave { group_id: String },
    CursorUpdate { group_id: String, cursor: CursorPos },
    ToolChange { group_id: String, tool: String },
    Heartbeat,
    CanvasJoin { room: String },
    CanvasLeave { room: String },
    DocUpdate { room: String, update: Vec<u8> },
    DocSyncRequest { room: String, state_vector: Vec<u8> },
    Awareness { room: String, state: CanvasAwareness },
}

/// Frames delivered to a client, either from the server or (for
/// `ConnectionStatus`) stamped locally by the client itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Ready { presence: UserPresence },
    AuthRejected { message: String },
    PresenceUpdated { presence: UserPresence },
    GroupPresence { group_id: String, members: Vec<UserPresence> },
    UserJoined { group_id: String, presence: UserPresence },
    UserLeft { group_id: String, user_id: String },
    UserInactive { group_id: String, user_id: String },
    CursorUpdated { group_id: String, user_id: String, cursor: CursorPos },
    ToolChanged { group_id: String, user_id: String, tool: String },
    HeartbeatAck,
    DocState { room: String, update: Vec<u8> },
    DocUpdate { room: String, user_id: String, update: Vec<u8> },
    Awareness { room: String, user_id: String, state: CanvasAwareness },
    DocError { room: String, message: String },
    ConnectionStatus { state: ConnectionState },
}

/// Flat discriminant of [`ServerFrame`], used as the dispatcher's
/// subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Ready,
    AuthRejected,
    PresenceUpdated,
    GroupPresence,
    UserJoined,
    UserLeft,
    UserInactive,
    CursorUpdated,
    ToolChanged,
    HeartbeatAck,
    DocState,
    DocUpdate,
    Awareness,
    DocError,
    ConnectionStatus,
}

impl ServerFrame {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerFrame::Ready { .. } => EventKind::Ready,
            ServerFrame::AuthRejected { .. } => EventKind::AuthRejected,
            ServerFrame::PresenceUpdated { .. } => EventKind::PresenceUpdated,
            ServerFrame::GroupPresence { .. } => EventKind::GroupPresence,
            ServerFrame::UserJoined { .. } => EventKind::UserJoined,
            ServerFrame::UserLeft { .. } => EventKind::UserLeft,
            ServerFrame::UserInactive { .. } => EventKind::UserInactive,
            ServerFrame::CursorUpdated { .. } => EventKind::CursorUpdated,
            ServerFrame::ToolChanged { .. } => EventKind::ToolChanged,
            ServerFrame::HeartbeatAck => EventKind::HeartbeatAck,
            ServerFrame::DocState { .. } => EventKind::DocState,
            ServerFrame::DocUpdate { .. } => EventKind::DocUpdate,
            ServerFrame::Awareness { .. } => EventKind::Awareness,
            ServerFrame::DocError { .. } => EventKind::DocError,
            ServerFrame::ConnectionStatus { .. } => EventKind::ConnectionStatus,
        }
    }

    /// The user this frame is about, where one exists.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            ServerFrame::Ready { presence } | ServerFrame::PresenceUpdated { presence } => {
                Some(&presence.user_id)
            }
            ServerFrame::UserJoined { presence, .. } => Some(&presence.user_id),
            ServerFrame::UserLeft { user_id, .. }
            | ServerFrame::UserInactive { user_id, .. }
            | ServerFrame::CursorUpdated { user_id, .. }
            | ServerFrame::ToolChanged { user_id, .. }
            | ServerFrame::DocUpdate { user_id, .. }
            | ServerFrame::Awareness { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    /// The group this frame is scoped to, where one exists.
    pub fn group_id(&self) -> Option<&str> {
        match self {
            ServerFrame::GroupPresence { group_id, .. }
            | ServerFrame::UserJoined { group_id, .. }
            | ServerFrame::UserLeft { group_id, .. }
            | ServerFrame::UserInactive { group_id, .. }
            | ServerFrame::CursorUpdated { group_id, .. }
            | ServerFrame::ToolChanged { group_id, .. } => Some(group_id),
            _ => None,
        }
    }
}

macro_rules! impl_wire_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to the binary wire format.
            pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
                bincode::serde::encode_to_vec(self, bincode::config::standard())
                    .map_err(|e| ProtocolError::Encode(e.to_string()))
            }

            /// Deserialize from the binary wire format.
            pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
                let (frame, _) =
                    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
                Ok(frame)
            }
        }
    };
}

impl_wire_codec!(ClientFrame);
impl_wire_codec!(ServerFrame);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_roundtrip() {
        let frame = ClientFrame::CursorUpdate {
            group_id: "g1".into(),
            cursor: CursorPos::new(12.5, -3.0),
        };
        let encoded = frame.encode().unwrap();
        let decoded = ClientFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_server_frame_roundtrip() {
        let frame = ServerFrame::UserJoined {
            group_id: "g1".into(),
            presence: UserPresence::new("u1", "Alice"),
        };
        let encoded = frame.encode().unwrap();
        let decoded = ServerFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.kind(), EventKind::UserJoined);
        assert_eq!(decoded.user_id(), Some("u1"));
        assert_eq!(decoded.group_id(), Some("g1"));
    }

    #[test]
    fn test_doc_update_payload_preserved() {
        let delta = vec![42u8; 512];
        let frame = ServerFrame::DocUpdate {
            room: "canvas-g1".into(),
            user_id: "u1".into(),
            update: delta.clone(),
        };
        let decoded = ServerFrame::decode(&frame.encode().unwrap()).unwrap();
        match decoded {
            ServerFrame::DocUpdate { update, .. } => assert_eq!(update, delta),
            other => panic!("expected DocUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ServerFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_canvas_room_validation() {
        assert!(validate_canvas_room("canvas-g1").is_ok());
        assert!(validate_canvas_room("canvas-").is_err());
        assert!(validate_canvas_room("group-g1").is_err());
        assert!(validate_canvas_room("").is_err());
    }

    #[test]
    fn test_color_stable_per_user() {
        assert_eq!(color_for_user("u1"), color_for_user("u1"));
        let c = color_for_user("u1");
        assert_eq!(c[3], 1.0);
    }

    #[test]
    fn test_presence_patch_default_is_empty() {
        let patch = PresencePatch::default();
        assert!(patch.cursor.is_none());
        assert!(patch.current_tool.is_none());
        assert!(patch.is_active.is_none());
    }

    #[test]
    fn test_connection_state_default() {
        let state = ConnectionState::default();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.reconnect_attempts, 0);
        assert!(state.last_error.is_none());
        assert!(state.last_connected.is_none());
    }
}
