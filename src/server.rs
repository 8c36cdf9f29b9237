//! WebSocket relay server for presence and canvas synchronization.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── group room ──── PresenceStore (liveness, cursors, tools)
//! Client B ──┘
//!
//! Client A ──┐
//!             ├── canvas room ─── CanvasRelay (authoritative Yrs doc)
//! Client C ──┘
//! ```
//!
//! Every connection authenticates with its first frame, then joins rooms.
//! Presence frames are fanned out within the sender's group room; canvas
//! frames are merged into the room's document and fanned out within the
//! canvas room. Nothing crosses room boundaries.
//!
//! A connection may subscribe to several rooms at once (its group plus any
//! number of canvases), so each connection owns one outgoing channel fed by
//! per-room forwarder tasks rather than a single broadcast receiver.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::broadcast::{group_room_name, Room, RoomFrame, RoomMember, RoomRegistry};
use crate::presence::PresenceStore;
use crate::protocol::{
    validate_canvas_room, ClientFrame, ProtocolError, ServerFrame, CANVAS_ROOM_PREFIX,
};
use crate::relay::CanvasRelay;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Time a client has to send its Authenticate frame
    pub auth_timeout: Duration,
    /// How often the stale-presence sweep runs
    pub sweep_interval: Duration,
    /// Heartbeat silence after which a user is marked inactive
    pub stale_threshold: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            auth_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub auth_failures: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub online_users: usize,
}

struct ServerShared {
    config: ServerConfig,
    auth: Arc<dyn AuthProvider>,
    presence: RwLock<PresenceStore>,
    rooms: RoomRegistry,
    relay: CanvasRelay,
    stats: RwLock<ServerStats>,
}

/// The relay server.
pub struct RealtimeServer {
    shared: Arc<ServerShared>,
}

impl RealtimeServer {
    pub fn new(config: ServerConfig, auth: Arc<dyn AuthProvider>) -> Self {
        let broadcast_capacity = config.broadcast_capacity;
        Self {
            shared: Arc::new(ServerShared {
                config,
                auth,
                presence: RwLock::new(PresenceStore::new()),
                rooms: RoomRegistry::new(broadcast_capacity),
                relay: CanvasRelay::new(),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    /// Bind the configured address, spawn the accept loop and the stale
    /// sweep, and return the bound address. Binding port 0 picks a free
    /// port, which the returned address reveals.
    pub async fn spawn(&self) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("realtime server listening on {addr}");

        let shared = self.shared.clone();
        tokio::spawn(Self::sweep_loop(shared.clone()));
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("accept failed: {e}");
                        continue;
                    }
                };
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(shared, stream, peer_addr).await {
                        log::debug!("connection from {peer_addr} ended: {e}");
                    }
                });
            }
        });
        Ok(addr)
    }

    /// Bind and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.spawn().await?;
        std::future::pending().await
    }

    async fn sweep_loop(shared: Arc<ServerShared>) {
        let mut interval = tokio::time::interval(shared.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let demoted = {
                let mut presence = shared.presence.write().await;
                presence.sweep_stale(shared.config.stale_threshold.as_millis() as u64)
            };
            for presence in demoted {
                let Some(group_id) = presence.group_id else {
                    continue;
                };
                log::debug!("user {} inactive in group {group_id}", presence.user_id);
                if let Some(room) = shared.rooms.get(&group_room_name(&group_id)).await {
                    let frame = ServerFrame::UserInactive {
                        group_id,
                        user_id: presence.user_id,
                    };
                    if let Err(e) = room.publish_frame(None, &frame) {
                        log::warn!("failed to publish inactivity notice: {e}");
                    }
                }
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.rooms.room_count().await;
        stats.online_users = self.shared.presence.read().await.len();
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn relay(&self) -> &CanvasRelay {
        &self.shared.relay
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.shared.rooms
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn send_frame(sink: &mut WsSink, frame: &ServerFrame) -> Result<(), ServerError> {
    let bytes = frame.encode()?;
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

/// Reject a canvas frame addressed outside the canvas namespace. Every
/// canvas-scoped frame passes through this, so clients cannot create relay
/// documents for arbitrary names or inject frames into group rooms.
/// Returns true when the frame was rejected.
async fn reject_invalid_room(sink: &mut WsSink, room: &str) -> Result<bool, ServerError> {
    match validate_canvas_room(room) {
        Ok(()) => Ok(false),
        Err(e) => {
            send_frame(
                sink,
                &ServerFrame::DocError {
                    room: room.to_string(),
                    message: e.to_string(),
                },
            )
            .await?;
            Ok(true)
        }
    }
}

/// Per-connection state after authentication.
struct Session {
    user_id: String,
    user_name: String,
    conn_id: Uuid,
    /// Outgoing frames merged from all subscribed rooms.
    out_tx: mpsc::Sender<Arc<Vec<u8>>>,
    /// Forwarder task per subscribed room, keyed by room name.
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Session {
    /// Subscribe to a room: register membership and spawn a forwarder that
    /// copies room traffic into this connection's outgoing channel, skipping
    /// frames this user originated.
    async fn subscribe(&mut self, name: &str, room: &Arc<Room>) {
        let mut rx = room
            .join(RoomMember {
                conn_id: self.conn_id,
                user_id: self.user_id.clone(),
                user_name: self.user_name.clone(),
            })
            .await;
        let user_id = self.user_id.clone();
        let out_tx = self.out_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(RoomFrame { origin, bytes }) => {
                        if origin.as_deref() == Some(user_id.as_str()) {
                            continue;
                        }
                        if out_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("user {user_id} lagged by {n} frames");
                    }
                    Err(_) => break,
                }
            }
        });
        if let Some(old) = self.forwarders.insert(name.to_string(), handle) {
            old.abort();
        }
    }

    async fn unsubscribe(&mut self, shared: &ServerShared, name: &str) {
        if let Some(handle) = self.forwarders.remove(name) {
            handle.abort();
        }
        if let Some(room) = shared.rooms.get(name).await {
            room.leave(self.conn_id).await;
        }
        shared.rooms.remove_if_empty(name).await;
    }
}

/// Publish a frame into a room the session belongs to, tagged with the
/// session's user so the sender's own forwarder skips it.
async fn publish_to_room(shared: &ServerShared, session: &Session, name: &str, frame: &ServerFrame) {
    if let Some(room) = shared.rooms.get(name).await {
        if let Err(e) = room.publish_frame(Some(&session.user_id), frame) {
            log::warn!("failed to publish to {name}: {e}");
        }
    }
}

async fn handle_connection(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::debug!("websocket connection established from {addr}");

    // First frame must authenticate, within the configured window.
    let identity = {
        let first = tokio::time::timeout(shared.config.auth_timeout, ws_receiver.next()).await;
        let token = match first {
            Ok(Some(Ok(Message::Binary(data)))) => match ClientFrame::decode(&data) {
                Ok(ClientFrame::Authenticate { token }) => Some(token),
                _ => None,
            },
            _ => None,
        };
        let validated = match token {
            Some(token) => shared.auth.validate(&token).await.ok(),
            None => None,
        };
        match validated {
            Some(identity) => identity,
            None => {
                shared.stats.write().await.auth_failures += 1;
                log::info!("authentication failed for {addr}");
                send_frame(
                    &mut ws_sender,
                    &ServerFrame::AuthRejected {
                        message: "authentication failed".to_string(),
                    },
                )
                .await?;
                let _ = ws_sender.close().await;
                return Ok(());
            }
        }
    };

    let conn_id = Uuid::new_v4();
    let presence = {
        let mut store = shared.presence.write().await;
        store.connect(identity.user_id.clone(), identity.user_name.clone(), conn_id)
    };
    {
        let mut stats = shared.stats.write().await;
        stats.total_connections += 1;
        stats.active_connections += 1;
    }
    log::info!("user {} ({}) connected from {addr}", identity.user_name, identity.user_id);
    send_frame(&mut ws_sender, &ServerFrame::Ready { presence }).await?;

    let (out_tx, mut out_rx) = mpsc::channel::<Arc<Vec<u8>>>(shared.config.broadcast_capacity);
    let mut session = Session {
        user_id: identity.user_id,
        user_name: identity.user_name,
        conn_id,
        out_tx,
        forwarders: HashMap::new(),
    };

    let result = connection_loop(&shared, &mut session, &mut ws_sender, &mut ws_receiver, &mut out_rx).await;

    teardown(&shared, &mut session).await;
    {
        let mut stats = shared.stats.write().await;
        stats.active_connections = stats.active_connections.saturating_sub(1);
    }
    log::info!("user {} disconnected", session.user_id);
    result
}

async fn connection_loop(
    shared: &Arc<ServerShared>,
    session: &mut Session,
    ws_sender: &mut WsSink,
    ws_receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    out_rx: &mut mpsc::Receiver<Arc<Vec<u8>>>,
) -> Result<(), ServerError> {
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut stats = shared.stats.write().await;
                            stats.total_frames += 1;
                            stats.total_bytes += data.len() as u64;
                        }
                        match ClientFrame::decode(&data) {
                            Ok(frame) => handle_frame(shared, session, ws_sender, frame).await?,
                            Err(e) => log::warn!("undecodable frame from {}: {e}", session.user_id),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::debug!("websocket error from {}: {e}", session.user_id);
                        break;
                    }
                    _ => {}
                }
            }
            frame = out_rx.recv() => {
                match frame {
                    Some(bytes) => {
                        ws_sender.send(Message::Binary(bytes.as_ref().clone().into())).await?;
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

async fn handle_frame(
    shared: &Arc<ServerShared>,
    session: &mut Session,
    ws_sender: &mut WsSink,
    frame: ClientFrame,
) -> Result<(), ServerError> {
    match frame {
        ClientFrame::Authenticate { .. } => {
            log::debug!("ignoring repeated authenticate from {}", session.user_id);
        }

        ClientFrame::Heartbeat => {
            shared.presence.write().await.touch(&session.user_id);
            send_frame(ws_sender, &ServerFrame::HeartbeatAck).await?;
        }

        ClientFrame::PresenceUpdate { patch } => {
            let updated = shared
                .presence
                .write()
                .await
                .apply_patch(&session.user_id, &patch);
            if let Some(presence) = updated {
                if let Some(group_id) = presence.group_id.clone() {
                    let room = group_room_name(&group_id);
                    publish_to_room(shared, session, &room, &ServerFrame::PresenceUpdated { presence })
                        .await;
                }
            }
        }

        ClientFrame::GroupJoin { group_id } => {
            // Subscribe before reading the snapshot: a concurrent joiner
            // missing from the snapshot then publishes its UserJoined into
            // a channel this session already receives, so no join is lost.
            let room_name = group_room_name(&group_id);
            let room = shared.rooms.get_or_create(&room_name).await;
            session.subscribe(&room_name, &room).await;

            let outcome = shared
                .presence
                .write()
                .await
                .join_group(&session.user_id, &group_id);
            let Some(outcome) = outcome else {
                session.unsubscribe(shared, &room_name).await;
                return Ok(());
            };

            // Switching groups implies leaving the previous one.
            if let Some(previous) = outcome.previous_group {
                let previous_room = group_room_name(&previous);
                publish_to_room(
                    shared,
                    session,
                    &previous_room,
                    &ServerFrame::UserLeft {
                        group_id: previous,
                        user_id: session.user_id.clone(),
                    },
                )
                .await;
                session.unsubscribe(shared, &previous_room).await;
            }

            // Snapshot to the joiner, join notice to everyone else.
            send_frame(
                ws_sender,
                &ServerFrame::GroupPresence {
                    group_id: group_id.clone(),
                    members: outcome.snapshot,
                },
            )
            .await?;
            publish_to_room(
                shared,
                session,
                &room_name,
                &ServerFrame::UserJoined {
                    group_id,
                    presence: outcome.presence,
                },
            )
            .await;
        }

        ClientFrame::GroupLeave { group_id } => {
            let left = shared
                .presence
                .write()
                .await
                .leave_group(&session.user_id, &group_id);
            if left.is_none() {
                return Ok(());
            }
            let room_name = group_room_name(&group_id);
            publish_to_room(
                shared,
                session,
                &room_name,
                &ServerFrame::UserLeft {
                    group_id,
                    user_id: session.user_id.clone(),
                },
            )
            .await;
            session.unsubscribe(shared, &room_name).await;
        }

        ClientFrame::CursorUpdate { group_id, cursor } => {
            let updated = shared
                .presence
                .write()
                .await
                .update_cursor(&session.user_id, cursor);
            if updated.is_some() {
                let room = group_room_name(&group_id);
                publish_to_room(
                    shared,
                    session,
                    &room,
                    &ServerFrame::CursorUpdated {
                        group_id,
                        user_id: session.user_id.clone(),
                        cursor,
                    },
                )
                .await;
            }
        }

        ClientFrame::ToolChange { group_id, tool } => {
            let updated = shared
                .presence
                .write()
                .await
                .change_tool(&session.user_id, &tool);
            if updated.is_some() {
                let room = group_room_name(&group_id);
                publish_to_room(
                    shared,
                    session,
                    &room,
                    &ServerFrame::ToolChanged {
                        group_id,
                        user_id: session.user_id.clone(),
                        tool,
                    },
                )
                .await;
            }
        }

        ClientFrame::CanvasJoin { room } => {
            if reject_invalid_room(ws_sender, &room).await? {
                return Ok(());
            }
            match shared.relay.join(&room).await {
                Ok(update) => {
                    let broadcast = shared.rooms.get_or_create(&room).await;
                    session.subscribe(&room, &broadcast).await;
                    send_frame(ws_sender, &ServerFrame::DocState { room, update }).await?;
                }
                Err(e) => {
                    send_frame(
                        ws_sender,
                        &ServerFrame::DocError {
                            room,
                            message: e.to_string(),
                        },
                    )
                    .await?;
                }
            }
        }

        ClientFrame::CanvasLeave { room } => {
            if reject_invalid_room(ws_sender, &room).await? {
                return Ok(());
            }
            session.unsubscribe(shared, &room).await;
            if shared.rooms.get(&room).await.is_none() {
                shared.relay.remove(&room).await;
            }
        }

        ClientFrame::DocUpdate { room, update } => {
            if reject_invalid_room(ws_sender, &room).await? {
                return Ok(());
            }
            // Merge first. A bad update is reported to its sender only and
            // never reaches the other peers.
            match shared.relay.apply_update(&room, &update).await {
                Ok(()) => {
                    publish_to_room(
                        shared,
                        session,
                        &room,
                        &ServerFrame::DocUpdate {
                            room: room.clone(),
                            user_id: session.user_id.clone(),
                            update,
                        },
                    )
                    .await;
                }
                Err(e) => {
                    log::warn!("rejected update for {room} from {}: {e}", session.user_id);
                    send_frame(
                        ws_sender,
                        &ServerFrame::DocError {
                            room,
                            message: e.to_string(),
                        },
                    )
                    .await?;
                }
            }
        }

        ClientFrame::DocSyncRequest { room, state_vector } => {
            if reject_invalid_room(ws_sender, &room).await? {
                return Ok(());
            }
            match shared.relay.diff(&room, &state_vector).await {
                Ok(update) => {
                    send_frame(ws_sender, &ServerFrame::DocState { room, update }).await?;
                }
                Err(e) => {
                    send_frame(
                        ws_sender,
                        &ServerFrame::DocError {
                            room,
                            message: e.to_string(),
                        },
                    )
                    .await?;
                }
            }
        }

        ClientFrame::Awareness { room, state } => {
            if reject_invalid_room(ws_sender, &room).await? {
                return Ok(());
            }
            // Pure relay: awareness never touches the document or the
            // presence store.
            publish_to_room(
                shared,
                session,
                &room,
                &ServerFrame::Awareness {
                    room: room.clone(),
                    user_id: session.user_id.clone(),
                    state,
                },
            )
            .await;
        }
    }
    Ok(())
}

/// Remove the session from presence and every subscribed room. Guarded by
/// the connection id, so a superseded socket's teardown leaves the new
/// socket's state alone.
async fn teardown(shared: &Arc<ServerShared>, session: &mut Session) {
    let removed = shared
        .presence
        .write()
        .await
        .disconnect(&session.user_id, session.conn_id);

    if let Some(presence) = removed {
        if let Some(group_id) = presence.group_id {
            let room_name = group_room_name(&group_id);
            if let Some(room) = shared.rooms.get(&room_name).await {
                let frame = ServerFrame::UserLeft {
                    group_id,
                    user_id: session.user_id.clone(),
                };
                if let Err(e) = room.publish_frame(Some(&session.user_id), &frame) {
                    log::warn!("failed to publish leave notice: {e}");
                }
            }
        }
    }

    let rooms: Vec<String> = session.forwarders.keys().cloned().collect();
    for name in rooms {
        session.unsubscribe(shared, &name).await;
        if name.starts_with(CANVAS_ROOM_PREFIX) && shared.rooms.get(&name).await.is_none() {
            shared.relay.remove(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RealtimeServer::new(ServerConfig::default(), Arc::new(StaticAuth::new()));
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.auth_failures, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.online_users, 0);
    }

    #[tokio::test]
    async fn test_spawn_binds_free_port() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let server = RealtimeServer::new(config, Arc::new(StaticAuth::new()));
        let addr = server.spawn().await.unwrap();
        assert_ne!(addr.port(), 0);
    }
}
