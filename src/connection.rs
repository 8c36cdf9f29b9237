//! Client-side connection state machine.
//!
//! Transport-agnostic: the machine owns reconnect/backoff/heartbeat policy
//! and drives a caller-supplied async connect function. The realtime client
//! binds it to a WebSocket; tests bind it to plain closures.
//!
//! Transitions:
//! ```text
//! disconnected → connecting → connected
//! connecting   → error        (failure, attempts exhausted)
//! connected    → disconnected (clean close)
//! connected    → reconnecting (unexpected drop)
//! reconnecting → connecting → connected
//! reconnecting → error        (max attempts reached)
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::protocol::{now_millis, ConnectionState, ConnectionStatus};

/// Reconnect and heartbeat policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Attempts before the machine gives up with a terminal error.
    pub max_attempts: u32,
    /// How long a single connect attempt may take before it counts as failed.
    pub connect_timeout: Duration,
    /// Interval between heartbeat ticks while connected.
    pub heartbeat_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Backoff delay for reconnect attempt `n` (1-based):
/// `min(base × 2^(n-1), max)`.
pub fn reconnect_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let delay = config.base_delay.saturating_mul(1u32 << exp);
    delay.min(config.max_delay)
}

type ConnectFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// The user-supplied connect operation. Invoked once per attempt; must
/// resolve Ok only after the transport is fully usable.
pub type ConnectFn = Arc<dyn Fn() -> ConnectFuture + Send + Sync>;

struct MachineInner {
    config: ReconnectConfig,
    status_tx: watch::Sender<ConnectionState>,
    connect_fn: Mutex<Option<ConnectFn>>,
    /// Epoch guard: bumped on disconnect so that in-flight attempts and
    /// sleeping backoff timers settle without mutating state.
    epoch: AtomicU64,
    connect_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_tx: mpsc::Sender<()>,
}

impl MachineInner {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn modify(&self, epoch: u64, f: impl FnOnce(&mut ConnectionState)) -> bool {
        if self.current_epoch() != epoch {
            return false;
        }
        self.status_tx.send_modify(f);
        true
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_task.lock().ok().and_then(|mut h| h.take()) {
            handle.abort();
        }
    }

    fn stop_connect_task(&self) {
        if let Some(handle) = self.connect_task.lock().ok().and_then(|mut h| h.take()) {
            handle.abort();
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        self.stop_heartbeat();
        let tx = self.heartbeat_tx.clone();
        let interval = self.config.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick is immediate; skip it
            loop {
                ticker.tick().await;
                // A full channel means no one is consuming ticks; drop them.
                if tx.try_send(()).is_err() && tx.is_closed() {
                    break;
                }
            }
        });
        if let Ok(mut slot) = self.heartbeat_task.lock() {
            *slot = Some(handle);
        }
    }
}

/// The connection state machine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConnectionMachine {
    inner: Arc<MachineInner>,
    heartbeat_rx: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<()>>>>,
}

impl ConnectionMachine {
    pub fn new(config: ReconnectConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionState::default());
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(8);
        Self {
            inner: Arc::new(MachineInner {
                config,
                status_tx,
                connect_fn: Mutex::new(None),
                epoch: AtomicU64::new(0),
                connect_task: Mutex::new(None),
                heartbeat_task: Mutex::new(None),
                heartbeat_tx,
            }),
            heartbeat_rx: Arc::new(tokio::sync::Mutex::new(Some(heartbeat_rx))),
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.inner.status_tx.borrow().clone()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status_tx.subscribe()
    }

    /// Take the heartbeat tick receiver (can only be taken once).
    pub async fn take_heartbeat_rx(&self) -> Option<mpsc::Receiver<()>> {
        self.heartbeat_rx.lock().await.take()
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }

    /// Begin connecting with the given connect operation.
    ///
    /// No-op while already connected or connecting. The operation is stored
    /// and re-invoked on every reconnect attempt until `disconnect()`.
    pub fn connect(&self, connect_fn: ConnectFn) {
        {
            let status = self.inner.status_tx.borrow().status;
            if matches!(status, ConnectionStatus::Connected | ConnectionStatus::Connecting) {
                return;
            }
        }
        if let Ok(mut slot) = self.inner.connect_fn.lock() {
            *slot = Some(connect_fn);
        }
        self.launch(false);
    }

    /// Signal an unexpected transport drop. Moves connected → reconnecting
    /// and re-runs the stored connect operation through the backoff loop.
    /// Clean closes should call `disconnect()` instead.
    pub fn connection_lost(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let status = self.inner.status_tx.borrow().status;
            if status != ConnectionStatus::Connected {
                return;
            }
        }
        self.inner.stop_heartbeat();
        let epoch = self.inner.current_epoch();
        self.inner.modify(epoch, |s| {
            s.status = ConnectionStatus::Reconnecting;
            s.last_error = Some(reason.clone());
        });
        log::warn!("connection lost: {reason}; reconnecting");
        self.launch(true);
    }

    /// Tear down: cancels every timer and pending attempt, resets the
    /// attempt counter, and emits a terminal disconnected status.
    pub fn disconnect(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.stop_connect_task();
        self.inner.stop_heartbeat();
        if let Ok(mut slot) = self.inner.connect_fn.lock() {
            *slot = None;
        }
        self.inner.status_tx.send_modify(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.reconnect_attempts = 0;
            s.last_error = None;
        });
        log::debug!("connection machine disconnected");
    }

    /// Spawn the attempt loop. `delayed_start` inserts one backoff step
    /// before the first attempt (the unexpected-drop path).
    fn launch(&self, delayed_start: bool) {
        let inner = self.inner.clone();
        let epoch = inner.current_epoch();
        inner.stop_connect_task();

        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let inner = task_inner;
            if delayed_start && !backoff_step(&inner, epoch, "connection dropped").await {
                return;
            }
            loop {
                if !inner.modify(epoch, |s| s.status = ConnectionStatus::Connecting) {
                    return;
                }
                let connect_fn = match inner.connect_fn.lock().ok().and_then(|f| f.clone()) {
                    Some(f) => f,
                    None => return,
                };
                let result =
                    tokio::time::timeout(inner.config.connect_timeout, connect_fn()).await;
                if inner.current_epoch() != epoch {
                    // disconnect() raced us; the settlement is ignored
                    return;
                }
                let error = match result {
                    Ok(Ok(())) => {
                        inner.modify(epoch, |s| {
                            s.status = ConnectionStatus::Connected;
                            s.reconnect_attempts = 0;
                            s.last_error = None;
                            s.last_connected = Some(now_millis());
                        });
                        inner.start_heartbeat();
                        log::info!("connected");
                        return;
                    }
                    Ok(Err(e)) => e,
                    Err(_) => "connect attempt timed out".to_string(),
                };
                log::warn!("connect attempt failed: {error}");
                if !backoff_step(&inner, epoch, &error).await {
                    return;
                }
            }
        });
        if let Ok(mut slot) = inner.connect_task.lock() {
            *slot = Some(handle);
        };
    }
}

/// Record a failed attempt and sleep the backoff delay. Returns false when
/// the loop must stop (attempts exhausted or the machine was torn down).
async fn backoff_step(inner: &Arc<MachineInner>, epoch: u64, error: &str) -> bool {
    let mut attempt = 0;
    let mut exhausted = false;
    let updated = inner.modify(epoch, |s| {
        s.reconnect_attempts += 1;
        attempt = s.reconnect_attempts;
        s.last_error = Some(error.to_string());
        if s.reconnect_attempts > inner.config.max_attempts {
            s.status = ConnectionStatus::Error;
            s.last_error = Some(format!("max reconnect attempts reached: {error}"));
            exhausted = true;
        } else {
            s.status = ConnectionStatus::Reconnecting;
        }
    });
    if !updated {
        return false;
    }
    if exhausted {
        log::error!("reconnect attempts exhausted after {}", attempt - 1);
        return false;
    }
    let delay = reconnect_delay(&inner.config, attempt);
    log::debug!("reconnect attempt {attempt} in {delay:?}");
    tokio::time::sleep(delay).await;
    inner.current_epoch() == epoch
}
