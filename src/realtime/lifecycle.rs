//! Connection identity and the close-once guard shared by WebSocket and SSE
//! connections.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

/// Opaque identity of one upgraded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Callback run once when a connection closes.
pub type CloseObserver = Box<dyn FnOnce(&ConnectionId) + Send + 'static>;

/// Flips exactly once and then runs every registered observer, in
/// registration order. Observers registered after the flip run immediately.
#[derive(Default)]
pub(crate) struct CloseGuard {
    closed: AtomicBool,
    observers: Mutex<Vec<CloseObserver>>,
}

impl fmt::Debug for CloseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseGuard")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl CloseGuard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` for the single caller that performed the close.
    pub(crate) fn close(&self, id: &ConnectionId) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let observers = std::mem::take(&mut *self.observers.lock());
        for observer in observers {
            observer(id);
        }
        true
    }

    pub(crate) fn on_closed(&self, id: &ConnectionId, observer: CloseObserver) {
        let mut observers = self.observers.lock();
        if self.is_closed() {
            drop(observers);
            observer(id);
        } else {
            observers.push(observer);
        }
    }
}
