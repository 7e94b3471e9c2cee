//! Broadcast-boundary queue for deferred messages.
//!
//! A room keeps one [`DeferredQueue`] per broadcast cycle and passes a
//! reference into each session's deferred-enqueue call; sessions never hold
//! a long-lived handle to room-global state. Entries are `(session, bytes)`
//! pairs in insertion order across *all* sessions of the cycle, and only the
//! room's broadcast boundary may flush them. When the boundary fires is the
//! room's business; this queue only guarantees FIFO flush semantics.

use std::sync::Mutex;

use crate::session::ClientSession;

/// Room-scoped queue of messages held until the next broadcast boundary.
#[derive(Default)]
pub struct DeferredQueue {
    entries: Mutex<Vec<(ClientSession, Vec<u8>)>>,
}

impl DeferredQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an encoded message for `session`. Insertion order across
    /// sessions is preserved until the flush.
    pub(crate) fn push(&self, session: &ClientSession, bytes: Vec<u8>) {
        self.entries
            .lock()
            .expect("deferred queue lock")
            .push((session.clone(), bytes));
    }

    /// Deliver all held messages in insertion order and clear the queue.
    ///
    /// Called by the owning room at its broadcast boundary. Entries whose
    /// session has meanwhile disconnected degrade to logged drops without
    /// affecting the rest. Returns the number of drained entries.
    pub fn flush(&self) -> usize {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock().expect("deferred queue lock");
            std::mem::take(&mut *entries)
        };

        let count = drained.len();
        for (session, bytes) in drained {
            let _ = session.raw_send(bytes);
        }
        if count > 0 {
            tracing::debug!(count, "flushed deferred messages");
        }
        count
    }

    /// Number of messages currently held.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("deferred queue lock").len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
