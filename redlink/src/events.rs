//! Lifecycle events emitted by connections, the pool and the cluster.
//!
//! Components take the sink by trait object so tests can inject a
//! recording sink instead of wiring real listeners.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Transport handshake started.
    Connecting,
    /// Transport handshake finished.
    Connected,
    /// Handshake and ready check passed; commands flow.
    Ready,
    /// The stream ended or was closed.
    Close,
    /// A reconnect is scheduled.
    Reconnecting {
        /// Attempt counter, starting at 1.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The connection gave up; no further attempts.
    End,
    /// A non-fatal error worth reporting.
    Error(String),
    /// A node joined the pool.
    NodeAdded(String),
    /// A node left the pool.
    NodeRemoved(String),
    /// The pool is empty.
    Drain,
}

/// Receives lifecycle events.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit(&self, event: Event);
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Sink that stores events for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    /// Shared, empty recorder.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything emitted so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("sink poisoned").clone()
    }

    /// Whether an event satisfying `pred` was emitted.
    pub fn saw(&self, pred: impl Fn(&Event) -> bool) -> bool {
        self.events.lock().expect("sink poisoned").iter().any(pred)
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("sink poisoned").push(event);
    }
}

/// Sink that forwards to a channel, for components that need to react to
/// events as well as pass them on.
pub struct ForwardSink {
    upstream: Arc<dyn EventSink>,
    tx: tokio::sync::mpsc::UnboundedSender<Event>,
}

impl ForwardSink {
    /// Forward every event to `upstream` and copy it into the channel.
    #[must_use]
    pub fn new(
        upstream: Arc<dyn EventSink>,
    ) -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Self { upstream, tx }), rx)
    }
}

impl EventSink for ForwardSink {
    fn emit(&self, event: Event) {
        let _ = self.tx.send(event.clone());
        self.upstream.emit(event);
    }
}
