//! Typed pub/sub core with bounded event history.
//!
//! Decoupled from any transport: the realtime client feeds decoded
//! [`ServerFrame`]s in, local subscribers register per-[`EventKind`]
//! handlers. Handler failures are isolated — a panicking handler is caught
//! and logged, and delivery to the remaining handlers continues.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::protocol::{now_millis, EventKind, ServerFrame};

/// Default capacity of the history ring buffer.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// A delivered event: the frame plus dispatcher-stamped id and timestamp.
/// Immutable once stamped; retained in the history ring for inspection.
#[derive(Debug, Clone)]
pub struct RealtimeEvent {
    /// Monotonic per-dispatcher sequence number.
    pub id: u64,
    pub kind: EventKind,
    pub payload: ServerFrame,
    /// Millis since epoch at emission.
    pub timestamp: u64,
}

/// Opaque handle identifying one registered handler.
///
/// Closures are not comparable, so deregistration is by handle rather than
/// by value; registering the same closure twice yields two handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

struct DispatcherInner {
    handlers: Mutex<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    history: Mutex<VecDeque<RealtimeEvent>>,
    history_capacity: usize,
    next_event_id: AtomicU64,
    next_handler_id: AtomicU64,
}

/// The dispatcher. Cheap to clone; all clones share handlers and history.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl EventDispatcher {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                handlers: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(history_capacity.min(1024))),
                history_capacity,
                next_event_id: AtomicU64::new(1),
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler for an event kind. Multiple handlers per kind are
    /// invoked in registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut handlers) = self.inner.handlers.lock() {
            handlers.entry(kind).or_default().push((id, Arc::new(handler)));
        }
        id
    }

    /// Deregister a handler. Unknown handles are ignored.
    pub fn off(&self, kind: EventKind, id: HandlerId) {
        if let Ok(mut handlers) = self.inner.handlers.lock() {
            if let Some(list) = handlers.get_mut(&kind) {
                list.retain(|(hid, _)| *hid != id);
                if list.is_empty() {
                    handlers.remove(&kind);
                }
            }
        }
    }

    /// Stamp and deliver a frame to every handler registered for its kind.
    ///
    /// Kinds with no handlers are recorded in history and otherwise dropped.
    /// A panicking handler is caught and logged; siblings still run and the
    /// emitter never observes the failure.
    pub fn emit(&self, payload: ServerFrame) -> RealtimeEvent {
        let event = RealtimeEvent {
            id: self.inner.next_event_id.fetch_add(1, Ordering::Relaxed),
            kind: payload.kind(),
            payload,
            timestamp: now_millis(),
        };

        if let Ok(mut history) = self.inner.history.lock() {
            if history.len() >= self.inner.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let handlers: Vec<(HandlerId, Handler)> = self
            .inner
            .handlers
            .lock()
            .ok()
            .and_then(|h| h.get(&event.kind).cloned())
            .unwrap_or_default();

        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                log::error!(
                    "event handler {id:?} for {:?} panicked; continuing delivery",
                    event.kind
                );
            }
        }

        event
    }

    /// Read the retained history, optionally filtered by kind, newest-last.
    /// Purely a read API; never replays into live handlers.
    pub fn history(&self, kind: Option<EventKind>, limit: Option<usize>) -> Vec<RealtimeEvent> {
        let history = match self.inner.history.lock() {
            Ok(h) => h,
            Err(_) => return Vec::new(),
        };
        let filtered: Vec<RealtimeEvent> = history
            .iter()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .cloned()
            .collect();
        match limit {
            Some(n) if n < filtered.len() => filtered[filtered.len() - n..].to_vec(),
            _ => filtered,
        }
    }

    /// Number of handlers registered for a kind.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .lock()
            .ok()
            .and_then(|h| h.get(&kind).map(Vec::len))
            .unwrap_or(0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Combinators
// ───────────────────────────────────────────────────────────────────

/// Delays delivery, restarting the timer on every call; only the last value
/// within a burst is delivered.
pub struct Debouncer<T: Send + 'static> {
    delay: Duration,
    callback: Arc<dyn Fn(T) + Send + Sync>,
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new<F>(delay: Duration, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            delay,
            callback: Arc::new(callback),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Schedule `value` for delivery after the delay, superseding any value
    /// still waiting.
    pub fn call(&self, value: T) {
        let callback = self.callback.clone();
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback(value);
        });
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(prev) = pending.replace(handle) {
                prev.abort();
            }
        }
    }

    /// Drop any value still waiting to fire.
    pub fn cancel(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(prev) = pending.take() {
                prev.abort();
            }
        }
    }
}

impl<T: Send + 'static> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Delivers at most once per interval; intermediate values are dropped.
/// Same policy as the cursor broadcast rate limiter on the wire.
pub struct Throttler<T> {
    interval: Duration,
    callback: Arc<dyn Fn(T) + Send + Sync>,
    last_fired: Mutex<Option<Instant>>,
}

impl<T> Throttler<T> {
    pub fn new<F>(interval: Duration, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            interval,
            callback: Arc::new(callback),
            last_fired: Mutex::new(None),
        }
    }

    /// Deliver `value` unless a delivery happened within the interval.
    /// Returns whether the value was delivered.
    pub fn call(&self, value: T) -> bool {
        let mut last = match self.last_fired.lock() {
            Ok(l) => l,
            Err(_) => return false,
        };
        if last.map_or(false, |t| t.elapsed() < self.interval) {
            return false;
        }
        *last = Some(Instant::now());
        drop(last);
        (self.callback)(value);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConnectionState;
    use std::sync::atomic::AtomicUsize;

    fn heartbeat_ack() -> ServerFrame {
        ServerFrame::HeartbeatAck
    }

    fn status_frame() -> ServerFrame {
        ServerFrame::ConnectionStatus {
            state: ConnectionState::default(),
        }
    }

    #[test]
    fn test_emit_invokes_registered_handler() {
        let dispatcher = EventDispatcher::default();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        dispatcher.on(EventKind::HeartbeatAck, move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit(heartbeat_ack());
        dispatcher.emit(heartbeat_ack());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_kind_is_dropped() {
        let dispatcher = EventDispatcher::default();
        // No handlers at all; must not panic or error
        let event = dispatcher.emit(heartbeat_ack());
        assert_eq!(event.kind, EventKind::HeartbeatAck);
    }

    #[test]
    fn test_handler_isolation_on_panic() {
        let dispatcher = EventDispatcher::default();
        let survived = Arc::new(AtomicUsize::new(0));
        let survived2 = survived.clone();

        dispatcher.on(EventKind::HeartbeatAck, |_| {
            panic!("faulty handler");
        });
        dispatcher.on(EventKind::HeartbeatAck, move |_| {
            survived2.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit(heartbeat_ack());
        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_removes_handler() {
        let dispatcher = EventDispatcher::default();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = dispatcher.on(EventKind::HeartbeatAck, move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(dispatcher.handler_count(EventKind::HeartbeatAck), 1);

        dispatcher.off(EventKind::HeartbeatAck, id);
        assert_eq!(dispatcher.handler_count(EventKind::HeartbeatAck), 0);

        dispatcher.emit(heartbeat_ack());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_event_ids_monotonic() {
        let dispatcher = EventDispatcher::default();
        let a = dispatcher.emit(heartbeat_ack());
        let b = dispatcher.emit(heartbeat_ack());
        assert!(b.id > a.id);
    }

    #[test]
    fn test_history_bounded_eviction() {
        let dispatcher = EventDispatcher::new(3);
        for _ in 0..5 {
            dispatcher.emit(heartbeat_ack());
        }
        let history = dispatcher.history(None, None);
        assert_eq!(history.len(), 3);
        // Oldest evicted first: ids 3, 4, 5 remain
        assert_eq!(history[0].id, 3);
        assert_eq!(history[2].id, 5);
    }

    #[test]
    fn test_history_filter_and_limit() {
        let dispatcher = EventDispatcher::default();
        dispatcher.emit(heartbeat_ack());
        dispatcher.emit(status_frame());
        dispatcher.emit(heartbeat_ack());

        let acks = dispatcher.history(Some(EventKind::HeartbeatAck), None);
        assert_eq!(acks.len(), 2);

        let latest = dispatcher.history(None, Some(1));
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].kind, EventKind::HeartbeatAck);
    }

    #[tokio::test]
    async fn test_debouncer_fires_only_last() {
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let debouncer = Debouncer::new(Duration::from_millis(20), move |v: u32| {
            seen2.lock().unwrap().push(v);
        });

        debouncer.call(1);
        debouncer.call(2);
        debouncer.call(3);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_debouncer_cancel() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let debouncer = Debouncer::new(Duration::from_millis(10), move |_: u32| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        debouncer.call(1);
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_throttler_drops_intermediates() {
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let throttler = Throttler::new(Duration::from_millis(50), move |v: u32| {
            seen2.lock().unwrap().push(v);
        });

        assert!(throttler.call(1)); // first always fires
        assert!(!throttler.call(2)); // inside interval — dropped
        assert!(!throttler.call(3));
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_throttler_fires_after_interval() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let throttler = Throttler::new(Duration::from_millis(5), move |_: u32| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(throttler.call(1));
        std::thread::sleep(Duration::from_millis(10));
        assert!(throttler.call(2));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
