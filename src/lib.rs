//! # groupsync — Real-time presence and canvas collaboration
//!
//! WebSocket relay for group presence (who is online, where their cursor
//! is, what tool they hold) and CRDT-backed canvas documents, with a client
//! that survives drops, sign-outs and flaky networks.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐      WebSocket      ┌────────────────┐
//! │ RealtimeClient │ ◄─────────────────► │ RealtimeServer │
//! │  (per user)    │    Binary frames    │   (central)    │
//! └───────┬────────┘                     └───────┬────────┘
//!         │                                      │
//!  ┌──────┴───────┐                     ┌────────┴────────┐
//!  │ Connection   │                     │ PresenceStore   │
//!  │ Machine      │                     │ (liveness)      │
//!  │ (backoff)    │                     ├─────────────────┤
//!  ├──────────────┤                     │ CanvasRelay     │
//!  │ CanvasDoc    │                     │ (Yrs authority) │
//!  │ (Yrs local)  │                     ├─────────────────┤
//!  ├──────────────┤                     │ RoomRegistry    │
//!  │ Dispatcher   │                     │ (fan-out)       │
//!  └──────────────┘                     └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded frames)
//! - [`connection`] — Client connection state machine with backoff
//! - [`dispatcher`] — Typed event dispatch, history, debounce/throttle
//! - [`presence`] — Server-side liveness map with staleness sweep
//! - [`broadcast`] — Room-based fan-out with backpressure
//! - [`relay`] — Authoritative per-room Yrs documents
//! - [`auth`] — Token validation and session lifecycle seams
//! - [`server`] — WebSocket relay server
//! - [`client`] — WebSocket realtime client
//! - [`document`] — Client-side collaborative canvas document

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod document;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod server;

// Re-exports for convenience
pub use auth::{AuthError, AuthProvider, Identity, SessionState, StaticAuth, StaticTokenSource, TokenSource};
pub use broadcast::{Room, RoomFrame, RoomMember, RoomRegistry, RoomStats};
pub use client::{ClientConfig, RealtimeClient};
pub use connection::{reconnect_delay, ConnectionMachine, ReconnectConfig};
pub use dispatcher::{Debouncer, EventDispatcher, HandlerId, RealtimeEvent, Throttler};
pub use document::{AwarenessEvent, CanvasDocument, DocumentError};
pub use presence::{JoinOutcome, PresenceStore};
pub use protocol::{
    color_for_user, validate_canvas_room, CanvasAwareness, CanvasElement, ClientFrame,
    ConnectionState, ConnectionStatus, CursorPos, EventKind, PresencePatch, ProtocolError,
    ServerFrame, UserPresence,
};
pub use relay::{CanvasRelay, RelayError, RelayPersistence, RoomDocInfo};
pub use server::{RealtimeServer, ServerConfig, ServerError, ServerStats};
