//! WebSocket realtime client.
//!
//! Binds the connection machine to an actual WebSocket: every attempt
//! fetches a fresh token, dials, authenticates with the first frame and only
//! counts as connected once the server answers `Ready`. Incoming frames flow
//! into the event dispatcher; outgoing presence traffic is fire-and-forget
//! and silently dropped while offline.
//!
//! After a reconnect the client replays its memberships: the current group
//! is rejoined and every joined canvas re-requests the full document state,
//! so the application converges without bookkeeping of its own.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{SessionState, TokenSource};
use crate::connection::{ConnectFn, ConnectionMachine, ReconnectConfig};
use crate::dispatcher::{EventDispatcher, HandlerId, RealtimeEvent, DEFAULT_HISTORY_CAPACITY};
use crate::protocol::{
    CanvasAwareness, ClientFrame, ConnectionState, ConnectionStatus, CursorPos, EventKind,
    PresencePatch, ServerFrame,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay server, e.g. `ws://127.0.0.1:9090`.
    pub url: String,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    machine: ConnectionMachine,
    dispatcher: EventDispatcher,
    token_source: Arc<dyn TokenSource>,
    /// Live writer for the current socket; `None` while offline.
    writer_tx: Mutex<Option<mpsc::Sender<ClientFrame>>>,
    /// Group to rejoin after a reconnect.
    current_group: Mutex<Option<String>>,
    /// Canvas rooms to rejoin after a reconnect.
    joined_canvases: Mutex<HashSet<String>>,
    /// Whether the application wants to be online. Drives the session
    /// watcher's connect-on-sign-in.
    wants_connection: AtomicBool,
}

impl ClientInner {
    fn store_writer(&self, tx: Option<mpsc::Sender<ClientFrame>>) {
        if let Ok(mut slot) = self.writer_tx.lock() {
            *slot = tx;
        }
    }

    fn writer(&self) -> Option<mpsc::Sender<ClientFrame>> {
        self.writer_tx.lock().ok().and_then(|slot| slot.clone())
    }
}

/// The realtime client. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    pub fn new(config: ClientConfig, token_source: Arc<dyn TokenSource>) -> Self {
        let machine = ConnectionMachine::new(config.reconnect.clone());
        let dispatcher = EventDispatcher::new(DEFAULT_HISTORY_CAPACITY);
        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                machine,
                dispatcher,
                token_source,
                writer_tx: Mutex::new(None),
                current_group: Mutex::new(None),
                joined_canvases: Mutex::new(HashSet::new()),
                wants_connection: AtomicBool::new(false),
            }),
        };
        client.spawn_status_relay();
        client.spawn_heartbeat_pump();
        client.spawn_session_watcher();
        client
    }

    /// Re-emit every connection state transition as an event, so status
    /// consumers and frame consumers share one subscription surface.
    fn spawn_status_relay(&self) {
        let inner = self.inner.clone();
        let mut rx = inner.machine.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow().clone();
                inner
                    .dispatcher
                    .emit(ServerFrame::ConnectionStatus { state });
            }
        });
    }

    fn spawn_heartbeat_pump(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let Some(mut ticks) = inner.machine.take_heartbeat_rx().await else {
                return;
            };
            while ticks.recv().await.is_some() {
                if let Some(tx) = inner.writer() {
                    let _ = tx.try_send(ClientFrame::Heartbeat);
                }
            }
        });
    }

    /// Sign-out tears the connection down; sign-in restores it if the
    /// application had asked to be online.
    fn spawn_session_watcher(&self) {
        let inner = self.inner.clone();
        let mut session = inner.token_source.session_watch();
        tokio::spawn(async move {
            while session.changed().await.is_ok() {
                let state = *session.borrow();
                match state {
                    SessionState::SignedOut => {
                        log::info!("signed out; closing realtime connection");
                        inner.store_writer(None);
                        inner.machine.disconnect();
                    }
                    SessionState::SignedIn => {
                        if inner.wants_connection.load(Ordering::SeqCst) {
                            log::info!("signed in; restoring realtime connection");
                            inner.machine.connect(make_connect_fn(inner.clone()));
                        }
                    }
                }
            }
        });
    }

    /// Begin connecting. No-op while already connected or connecting.
    pub fn connect(&self) {
        self.inner.wants_connection.store(true, Ordering::SeqCst);
        self.inner
            .machine
            .connect(make_connect_fn(self.inner.clone()));
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        self.inner.wants_connection.store(false, Ordering::SeqCst);
        self.inner.store_writer(None);
        self.inner.machine.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine.state()
    }

    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.inner.machine.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().status == ConnectionStatus::Connected
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: HandlerId) {
        self.inner.dispatcher.off(kind, id)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    /// Send a frame if connected. Fire-and-forget: returns whether the frame
    /// was handed to the transport.
    pub fn send(&self, frame: ClientFrame) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.inner.writer() {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    pub fn update_presence(&self, patch: PresencePatch) -> bool {
        self.send(ClientFrame::PresenceUpdate { patch })
    }

    /// Join a group. The membership is remembered and replayed after every
    /// reconnect.
    pub fn join_group(&self, group_id: impl Into<String>) -> bool {
        let group_id = group_id.into();
        if let Ok(mut current) = self.inner.current_group.lock() {
            *current = Some(group_id.clone());
        }
        self.send(ClientFrame::GroupJoin { group_id })
    }

    pub fn leave_group(&self, group_id: impl Into<String>) -> bool {
        let group_id = group_id.into();
        if let Ok(mut current) = self.inner.current_group.lock() {
            if current.as_deref() == Some(group_id.as_str()) {
                *current = None;
            }
        }
        self.send(ClientFrame::GroupLeave { group_id })
    }

    pub fn update_cursor(&self, group_id: impl Into<String>, cursor: CursorPos) -> bool {
        self.send(ClientFrame::CursorUpdate {
            group_id: group_id.into(),
            cursor,
        })
    }

    pub fn change_tool(&self, group_id: impl Into<String>, tool: impl Into<String>) -> bool {
        self.send(ClientFrame::ToolChange {
            group_id: group_id.into(),
            tool: tool.into(),
        })
    }

    /// Join a canvas room. Remembered and replayed after reconnects, where
    /// the server answers with the full document state each time.
    pub fn join_canvas(&self, room: impl Into<String>) -> bool {
        let room = room.into();
        if let Ok(mut joined) = self.inner.joined_canvases.lock() {
            joined.insert(room.clone());
        }
        self.send(ClientFrame::CanvasJoin { room })
    }

    pub fn leave_canvas(&self, room: impl Into<String>) -> bool {
        let room = room.into();
        if let Ok(mut joined) = self.inner.joined_canvases.lock() {
            joined.remove(&room);
        }
        self.send(ClientFrame::CanvasLeave { room })
    }

    pub fn send_doc_update(&self, room: impl Into<String>, update: Vec<u8>) -> bool {
        self.send(ClientFrame::DocUpdate {
            room: room.into(),
            update,
        })
    }

    pub fn request_doc_sync(&self, room: impl Into<String>, state_vector: Vec<u8>) -> bool {
        self.send(ClientFrame::DocSyncRequest {
            room: room.into(),
            state_vector,
        })
    }

    pub fn send_awareness(&self, room: impl Into<String>, state: CanvasAwareness) -> bool {
        self.send(ClientFrame::Awareness {
            room: room.into(),
            state,
        })
    }
}

fn make_connect_fn(inner: Arc<ClientInner>) -> ConnectFn {
    Arc::new(move || {
        let inner = inner.clone();
        Box::pin(async move { establish(inner).await })
    })
}

/// One connection attempt: dial, authenticate, wait for `Ready`, then wire
/// up the reader and writer tasks and replay memberships.
async fn establish(inner: Arc<ClientInner>) -> Result<(), String> {
    let token = inner
        .token_source
        .fetch_token()
        .await
        .map_err(|e| e.to_string())?;

    let (ws_stream, _) = tokio_tungstenite::connect_async(inner.config.url.as_str())
        .await
        .map_err(|e| format!("websocket connect failed: {e}"))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let auth = ClientFrame::Authenticate { token }
        .encode()
        .map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(auth.into()))
        .await
        .map_err(|e| format!("authenticate send failed: {e}"))?;

    // The server answers Ready or AuthRejected before anything else.
    let first = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Binary(data))) => {
                break ServerFrame::decode(&data).map_err(|e| e.to_string())?;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(_)) | None => return Err("connection closed during handshake".to_string()),
            Some(Err(e)) => return Err(format!("handshake failed: {e}")),
        }
    };

    match first {
        ServerFrame::Ready { .. } => {
            inner.dispatcher.emit(first);
        }
        ServerFrame::AuthRejected { .. } => {
            // Terminal for this token: stop the retry loop. The intent to be
            // online is kept, so a fresh sign-in reconnects automatically.
            log::error!("authentication rejected by server");
            inner.dispatcher.emit(first);
            let machine = inner.machine.clone();
            tokio::spawn(async move { machine.disconnect() });
            return Err("authentication rejected".to_string());
        }
        other => {
            return Err(format!("unexpected handshake frame: {:?}", other.kind()));
        }
    }

    let (tx, mut rx) = mpsc::channel::<ClientFrame>(64);

    // Writer: serializes outgoing frames onto the socket. The channel
    // closing means disconnect or sign-out; close the socket properly so
    // the server tears the session down and announces the departure.
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let bytes = match frame.encode() {
                Ok(b) => b,
                Err(e) => {
                    log::warn!("dropping unencodable frame: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // Reader: feeds the dispatcher until the socket drops, then reports the
    // loss. The machine ignores the report after a clean disconnect.
    let reader_inner = inner.clone();
    tokio::spawn(async move {
        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                    Ok(frame) => {
                        reader_inner.dispatcher.emit(frame);
                    }
                    Err(e) => log::warn!("undecodable server frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("websocket read error: {e}");
                    break;
                }
                _ => {}
            }
        }
        reader_inner.store_writer(None);
        reader_inner.machine.connection_lost("server connection closed");
    });

    // Replay memberships before the attempt resolves, so the frames are
    // queued ahead of anything the application sends.
    let group = inner.current_group.lock().ok().and_then(|g| g.clone());
    if let Some(group_id) = group {
        let _ = tx.send(ClientFrame::GroupJoin { group_id }).await;
    }
    let canvases: Vec<String> = inner
        .joined_canvases
        .lock()
        .map(|rooms| rooms.iter().cloned().collect())
        .unwrap_or_default();
    for room in canvases {
        let _ = tx.send(ClientFrame::CanvasJoin { room }).await;
    }

    inner.store_writer(Some(tx));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;

    fn offline_client() -> RealtimeClient {
        RealtimeClient::new(
            ClientConfig::new("ws://127.0.0.1:1"),
            Arc::new(StaticTokenSource::signed_in("tok")),
        )
    }

    #[tokio::test]
    async fn test_send_dropped_while_offline() {
        let client = offline_client();
        assert!(!client.is_connected());
        assert!(!client.send(ClientFrame::Heartbeat));
        assert!(!client.update_cursor("g1", CursorPos::new(1.0, 2.0)));
        assert!(!client.update_presence(PresencePatch::default()));
    }

    #[tokio::test]
    async fn test_memberships_recorded_while_offline() {
        let client = offline_client();
        client.join_group("g1");
        client.join_canvas("canvas-g1");

        assert_eq!(
            client.inner.current_group.lock().unwrap().as_deref(),
            Some("g1")
        );
        assert!(client
            .inner
            .joined_canvases
            .lock()
            .unwrap()
            .contains("canvas-g1"));

        client.leave_group("g1");
        client.leave_canvas("canvas-g1");
        assert!(client.inner.current_group.lock().unwrap().is_none());
        assert!(client.inner.joined_canvases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_registration() {
        let client = offline_client();
        let id = client.on(EventKind::Ready, |_| {});
        assert_eq!(client.dispatcher().handler_count(EventKind::Ready), 1);
        client.off(EventKind::Ready, id);
        assert_eq!(client.dispatcher().handler_count(EventKind::Ready), 0);
    }

    #[tokio::test]
    async fn test_initial_state_disconnected() {
        let client = offline_client();
        assert_eq!(client.state().status, ConnectionStatus::Disconnected);
        assert_eq!(client.state().reconnect_attempts, 0);
    }
}
