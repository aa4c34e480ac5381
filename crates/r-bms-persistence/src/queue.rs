//! ---
//! bms_section: "03-persistence-logging"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Bounded producer/consumer queue feeding the log writer."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use r_bms_common::CancellationToken;

/// Multi-producer, single-consumer queue with a hard bound.
///
/// Producers never block: a push onto a full queue hands the item back.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Append `item`, or return it when the queue is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.available.notify_one();
        Ok(())
    }

    /// Take the oldest item, waiting while the queue is empty.
    ///
    /// Returns `None` once `cancel` fired and the queue has been drained, so
    /// every accepted item is delivered before the consumer stops. Callers
    /// must register [`BoundedQueue::wake`] with the token's cancel hooks.
    pub fn pop_wait(&self, cancel: &CancellationToken) -> Option<T> {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if cancel.is_cancelled() {
                return None;
            }
            self.available.wait(&mut items);
        }
    }

    /// Take the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Wake every waiting consumer so it re-checks its cancellation token.
    pub fn wake(&self) {
        // Taking the lock orders this notify after any in-progress check.
        let _items = self.items.lock();
        self.available.notify_all();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Configured bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
