//! Thread-safe FIFO shared between application code and socket tasks.
//!
//! [`BlockingMessageQueue`] supports non-blocking and blocking dequeue. A
//! blocking dequeue can be released early by turning blocking off, which is
//! how [`QueuedConnection::stop`](super::QueuedConnection::stop) frees a
//! receiver parked on an empty inbound queue.
//!
//! The mutex is never held across an `.await`; waiting is done on
//! [`tokio::sync::Notify`] with the waiter registered *before* the state
//! check so no wake-up can slip between check and sleep.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    blocking_allowed: bool,
}

/// FIFO of pending messages with a runtime "allow blocking" switch.
#[derive(Debug)]
pub struct BlockingMessageQueue<T> {
    state: Mutex<QueueState<T>>,
    /// Signalled once per enqueue and broadcast when blocking is disabled.
    item_available: Notify,
    /// Broadcast whenever a removal leaves the queue empty.
    emptied: Notify,
}

impl<T> BlockingMessageQueue<T> {
    /// Create an empty queue with blocking allowed.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                blocking_allowed: true,
            }),
            item_available: Notify::new(),
            emptied: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // Callbacks never run under this lock, so poisoning only means a
        // panic mid push/pop; the VecDeque itself is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `msg` at the tail and wake one blocked dequeuer.
    pub fn enqueue(&self, msg: T) {
        self.lock().items.push_back(msg);
        self.item_available.notify_one();
    }

    /// Pop the head without waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.items.pop_front();
        if item.is_some() && state.items.is_empty() {
            self.emptied.notify_waiters();
        }
        item
    }

    /// Pop the head, optionally waiting for one to arrive.
    ///
    /// With `block == false`, or while blocking is disallowed, an empty
    /// queue yields `None` immediately. Otherwise the caller is suspended
    /// until a message is enqueued or blocking is switched off.
    pub async fn dequeue(&self, block: bool) -> Option<T> {
        loop {
            let notified = self.item_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    if state.items.is_empty() {
                        self.emptied.notify_waiters();
                    }
                    return Some(item);
                }
                if !block || !state.blocking_allowed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Number of queued messages.
    pub fn size(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Allow or forbid blocking dequeues.
    ///
    /// Switching blocking off wakes every suspended [`dequeue`](Self::dequeue)
    /// so it can observe the flag and return `None`.
    pub fn set_blocking_allowed(&self, allowed: bool) {
        let was_allowed = std::mem::replace(&mut self.lock().blocking_allowed, allowed);
        if was_allowed && !allowed {
            self.item_available.notify_waiters();
        }
    }

    /// Current state of the blocking switch.
    pub fn is_blocking_allowed(&self) -> bool {
        self.lock().blocking_allowed
    }

    /// Wait until the queue is observed empty.
    pub async fn wait_until_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until at least one message is queued, without removing it.
    ///
    /// Intended for the single task that drains this queue; it consumes the
    /// wake-up a concurrent blocking [`dequeue`](Self::dequeue) would
    /// otherwise receive.
    pub async fn wait_for_item(&self) {
        loop {
            let notified = self.item_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl<T: Clone> BlockingMessageQueue<T> {
    /// Clone of the head message, leaving it queued.
    ///
    /// The writer task peeks, sends, and only then pops, so a failed send
    /// keeps the message.
    pub fn front(&self) -> Option<T> {
        self.lock().items.front().cloned()
    }
}

impl<T> Default for BlockingMessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
