//! Session event types and subscriber plumbing.
//!
//! The session is the single producer; subscribers are callbacks held behind
//! the engine lock and invoked synchronously, in registration order, after
//! each state mutation completes. Handlers must not call back into the
//! session on the same thread of execution; they may schedule work.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Notifications delivered to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Initial population from the JOIN payload is complete.
    Joined,
    /// These cells' values changed; the UI must re-read them.
    Updated(Vec<String>),
    /// The server rejected a request. The last line is human-readable.
    Failed(Vec<String>),
    /// The server's undo stack is empty.
    UndoEnd,
    ConnectionClosed,
    SocketError(String),
    /// A bare `ERROR` frame or an unusable reply.
    GenericError,
}

/// A registered event subscriber.
pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Event sink for tests and simple hosts: records everything it sees.
#[derive(Clone, Default)]
pub struct EventCollector {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl EventCollector {
    pub fn new() -> EventCollector {
        EventCollector::default()
    }

    /// A handler that appends every event to this collector.
    pub fn handler(&self) -> EventHandler {
        let events = Arc::clone(&self.events);
        Arc::new(move |event| {
            events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event.clone());
        })
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Poll until `pred` holds over the events seen so far, or `timeout`
    /// elapses. Returns whether the predicate was satisfied.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&[SessionEvent]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(&self.events()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
