//! Defines the bounded queue of requests suspended by an oplock break ---
//! [`DeferredQueue`].

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::buffer::MessageBuffer;
use crate::session::SessionRef;

/// One suspended client operation awaiting an oplock break.
///
/// Holds the sole reference to its inbound message buffer until it is
/// resumed or failed.
#[derive(Debug)]
pub struct DeferredRequest {
    pub session: SessionRef,
    pub message: MessageBuffer,
    pub deferred_at: Instant,
}

impl DeferredRequest {
    pub fn new(session: SessionRef, message: MessageBuffer) -> Self {
        Self { session, message, deferred_at: Instant::now() }
    }
}

/// Requeue outcome counters.
///
/// `attempted` counts every request taken off the queue; `requeued` counts
/// those actually accepted by the worker pool. They diverge only when the
/// pool rejects a resumed request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueStats {
    pub attempted: usize,
    pub requeued: usize,
}

/// Bounded FIFO of suspended operations, owned by one oplock record.
///
/// The queue mutex is subordinate to the per-state lock: callers holding
/// both acquire the state lock first.
#[derive(Debug)]
pub struct DeferredQueue {
    inner: Mutex<VecDeque<DeferredRequest>>,
    capacity: usize,
}

impl DeferredQueue {
    /// Creates an empty queue accepting at most `capacity` requests.
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("deferred queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a suspended request.
    ///
    /// A full queue hands the request back so the caller can fail it to
    /// the client as [`crate::error::Error::DeferFailed`]; dropping it
    /// returns the message buffer to its pool.
    pub fn push(&self, request: DeferredRequest) -> std::result::Result<(), DeferredRequest> {
        let mut queue = self.inner.lock().expect("deferred queue poisoned");
        if queue.len() >= self.capacity {
            return Err(request);
        }
        queue.push_back(request);
        Ok(())
    }

    /// Takes every queued request, preserving insertion order.
    pub fn drain(&self) -> Vec<DeferredRequest> {
        let mut queue = self.inner.lock().expect("deferred queue poisoned");
        queue.drain(..).collect()
    }

    /// Extends the message-buffer lease of every queued request.
    /// Returns the number of refreshed leases.
    pub fn refresh_leases(&self, window: Duration) -> usize {
        let queue = self.inner.lock().expect("deferred queue poisoned");
        for request in queue.iter() {
            request.message.refresh_lease(window);
        }
        queue.len()
    }
}

impl Drop for DeferredQueue {
    fn drop(&mut self) {
        // Scope-guarded release: every deferred request must have been
        // requeued or failed before the owning oplock record goes away.
        if let Ok(queue) = self.inner.get_mut() {
            debug_assert!(queue.is_empty(), "deferred requests leaked on queue drop");
        }
    }
}
