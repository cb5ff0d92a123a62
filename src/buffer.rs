//! Defines the pooled inbound-message buffers --- [`BufferPool`] and
//! [`MessageBuffer`].
//!
//! Each inbound SMB request owns exactly one buffer from the moment it is
//! read off the wire. While a request sits in a deferred queue, the break
//! scheduler refreshes the buffer's lease so the pool does not reclaim it;
//! dropping the buffer returns it to the free list.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use crate::clock;

struct Slab {
    data: Box<[u8]>,
    lease_deadline: AtomicU64,
}

struct Shared {
    free: ArrayQueue<Slab>,
}

/// Fixed-size pool of message buffers.
pub struct BufferPool {
    shared: Arc<Shared>,
    size: usize,
}

impl BufferPool {
    /// Creates a pool of `count` buffers of `size` bytes each.
    pub fn new(size: NonZeroUsize, count: NonZeroUsize) -> Self {
        let free = ArrayQueue::new(count.get());
        for _ in 0..count.get() {
            let slab = Slab {
                data: vec![0; size.get()].into_boxed_slice(),
                lease_deadline: AtomicU64::new(0),
            };
            let pushed = free.push(slab);
            assert!(pushed.is_ok(), "free list sized for every slab");
        }
        Self { shared: Arc::new(Shared { free }), size: size.get() }
    }

    /// Size in bytes of each pooled buffer.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Number of buffers currently sitting in the free list.
    pub fn available(&self) -> usize {
        self.shared.free.len()
    }

    /// Takes a buffer from the pool, granting it a lease of `lease_window`.
    ///
    /// Returns `None` when the pool is exhausted; callers surface that as
    /// backpressure to the transport.
    pub fn acquire(&self, lease_window: Duration) -> Option<MessageBuffer> {
        let slab = self.shared.free.pop()?;
        slab.lease_deadline
            .store(clock::now_millis() + clock::millis(lease_window), Ordering::Relaxed);
        Some(MessageBuffer {
            slab: Some(slab),
            shared: Arc::clone(&self.shared),
            len: 0,
        })
    }
}

/// Owned inbound-message buffer.
///
/// Holds the payload of one suspended or in-flight request. Returns itself
/// to the pool on drop.
pub struct MessageBuffer {
    slab: Option<Slab>,
    shared: Arc<Shared>,
    len: usize,
}

impl MessageBuffer {
    /// Copies `payload` into the buffer and records its length.
    ///
    /// Payloads longer than the pooled buffer size are truncated to it.
    pub fn fill(&mut self, payload: &[u8]) {
        let slab = self.slab.as_mut().expect("buffer not yet returned");
        let len = payload.len().min(slab.data.len());
        slab.data[..len].copy_from_slice(&payload[..len]);
        self.len = len;
    }

    /// Bytes of the stored message.
    pub fn payload(&self) -> &[u8] {
        let slab = self.slab.as_ref().expect("buffer not yet returned");
        &slab.data[..self.len]
    }

    /// Extends the buffer's lease to `now + lease_window`.
    pub fn refresh_lease(&self, lease_window: Duration) {
        let slab = self.slab.as_ref().expect("buffer not yet returned");
        slab.lease_deadline
            .store(clock::now_millis() + clock::millis(lease_window), Ordering::Relaxed);
    }

    /// Milliseconds-since-epoch deadline of the current lease.
    pub fn lease_deadline(&self) -> u64 {
        let slab = self.slab.as_ref().expect("buffer not yet returned");
        slab.lease_deadline.load(Ordering::Relaxed)
    }

    /// Tells whether the lease has lapsed.
    pub fn lease_expired(&self) -> bool {
        self.lease_deadline() < clock::now_millis()
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        if let Some(slab) = self.slab.take() {
            // Pool capacity equals the number of slabs ever created, so the
            // push can only fail if a slab was duplicated.
            if self.shared.free.push(slab).is_err() {
                debug_assert!(false, "buffer returned to a full pool");
            }
        }
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests;
