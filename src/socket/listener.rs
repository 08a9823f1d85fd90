//! Observer contract for queued connection events.
//!
//! Listeners are invoked from the reader task, the writer task, or the
//! application task calling `send()`. Dispatch snapshots the listener set
//! under its lock and releases the lock before calling out, so a callback
//! may add or remove listeners (itself included) without deadlocking.
//!
//! A panicking listener is caught and logged; the remaining listeners still
//! run and the dispatching task carries on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::queued::QueuedConnection;
use super::{Payload, SocketError};

/// Handle returned by [`ListenerSet::add`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callbacks for connection lifecycle events.
///
/// Every method defaults to a no-op, so implementors override only what
/// they care about. Callbacks run synchronously on socket tasks: keep them
/// short and never block.
pub trait ConnectionListener<T>: Send + Sync {
    /// A message was accepted by `send()` onto the outbound queue.
    fn object_enqueued(&self, _conn: &QueuedConnection<T>, _msg: &T) {}

    /// A message was written to the wire and removed from the outbound queue.
    fn object_sent(&self, _conn: &QueuedConnection<T>, _msg: &T) {}

    /// A message arrived and was placed on the inbound queue.
    fn object_received(&self, _conn: &QueuedConnection<T>, _msg: &T) {}

    /// The connection failed and its tasks have stopped.
    fn exception_occurred(&self, _conn: &QueuedConnection<T>, _err: &SocketError) {}
}

/// Listener that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl<T: Payload + std::fmt::Debug> ConnectionListener<T> for LoggingListener {
    fn object_enqueued(&self, conn: &QueuedConnection<T>, msg: &T) {
        log::debug!("[Socket] {} enqueued {:?}", conn.id(), msg);
    }

    fn object_sent(&self, conn: &QueuedConnection<T>, msg: &T) {
        log::debug!("[Socket] {} sent {:?}", conn.id(), msg);
    }

    fn object_received(&self, conn: &QueuedConnection<T>, msg: &T) {
        log::debug!("[Socket] {} received {:?}", conn.id(), msg);
    }

    fn exception_occurred(&self, conn: &QueuedConnection<T>, err: &SocketError) {
        log::error!("[Socket] {} failed: {err}", conn.id());
    }
}

type Entry<T> = (ListenerId, Arc<dyn ConnectionListener<T>>);

/// Registered listeners with copy-on-dispatch iteration.
pub struct ListenerSet<T> {
    entries: Mutex<Vec<Entry<T>>>,
    next_id: AtomicU64,
}

impl<T> std::fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> ListenerSet<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a listener.
    pub fn add(&self, listener: Arc<dyn ConnectionListener<T>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke `f` on a snapshot of the registered listeners.
    ///
    /// Listeners added during dispatch see the next event, not this one.
    /// Listeners removed during dispatch may still see this one.
    pub fn dispatch<F>(&self, f: F)
    where
        F: Fn(&dyn ConnectionListener<T>),
    {
        let snapshot: Vec<Arc<dyn ConnectionListener<T>>> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                log::warn!("[Socket] Listener panicked during dispatch; continuing");
            }
        }
    }
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
