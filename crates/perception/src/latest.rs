//! Single-slot, last-value-wins handoff.

use std::sync::{Arc, Mutex};

/// A one-value mailbox shared between a writer thread and any number of
/// reader threads.
///
/// `write` unconditionally replaces the held value; `read` returns the most
/// recent one, or `None` before the first write. Values between two reads
/// are dropped silently; only the freshest matters to consumers. The inner
/// lock is held only for the pointer swap, so neither side ever waits on the
/// other's work.
pub struct LatestSlot<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Replace the held value. Never blocks on readers' use of prior values.
    pub fn write(&self, value: T) {
        let fresh = Arc::new(value);
        if let Ok(mut guard) = self.slot.lock() {
            *guard = Some(fresh);
        }
    }

    /// The most recently written value, or `None` before the first write.
    ///
    /// A read racing a concurrent write returns either the old or the new
    /// value, never a partial one: the swap is a single pointer replacement
    /// under the lock.
    pub fn read(&self) -> Option<Arc<T>> {
        self.slot.lock().ok().and_then(|guard| guard.clone())
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
