//! Defines the oplock break scheduler --- [`OplockBreaker`].
//!
//! The scheduler carries a break cycle across its three stages: it sends
//! the break request to the owning client, keeps the suspended requests'
//! buffer leases alive, and finishes the cycle either by requeueing every
//! deferred request to the worker pool (acknowledgement) or by failing
//! them with access-denied (timeout). All client I/O happens outside the
//! per-state lock.

pub mod packet;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::buffer::MessageBuffer;
use crate::config::{CacheConfig, DebugFlags};
use crate::defer::{DeferredQueue, DeferredRequest, RequeueStats};
use crate::error::Error;
use crate::path::PathKey;
use crate::session::SessionRef;
use crate::state::oplock::OplockLevel;

/// Seam to the dispatcher's client connections.
#[async_trait]
pub trait BreakTransport: Send + Sync {
    /// Writes an oplock break packet to the owning client. Returns once
    /// the dispatcher reports the packet written; the break timer is
    /// measured from that moment.
    async fn send_break(&self, session: &SessionRef, packet: Vec<u8>) -> std::io::Result<()>;

    /// Completes a suspended request with an error response to its client.
    async fn fail_request(&self, session: &SessionRef, message: &[u8], error: &Error);
}

/// A deferred request handed back to the worker pool after a break
/// resolves. Carries its message buffer; ownership moves to the worker.
#[derive(Debug)]
pub struct ResumedRequest {
    pub path: PathKey,
    pub session: SessionRef,
    pub message: MessageBuffer,
}

/// Sender half of the shared worker-pool queue.
pub type WorkerSender = async_channel::Sender<ResumedRequest>;

/// Receiver half of the shared worker-pool queue; the dispatcher's
/// workers consume it.
pub type WorkerReceiver = async_channel::Receiver<ResumedRequest>;

/// Creates the bounded worker-pool queue resumed requests are posted to.
pub fn worker_queue(capacity: usize) -> (WorkerSender, WorkerReceiver) {
    async_channel::bounded(capacity)
}

/// Hook invoked when a break timer fires. Implemented by each cache
/// variant: it marks the oplock failed under its own state lock and
/// reports whether the timeout still applies.
pub trait BreakTimeoutHandler: Send + Sync {
    /// Returns false when the break already resolved, in which case the
    /// timer fires into nothing.
    fn mark_break_failed(&self, path: &PathKey) -> bool;
}

/// Cross-component service driving oplock break cycles.
pub struct OplockBreaker {
    config: CacheConfig,
    transport: Arc<dyn BreakTransport>,
    workers: WorkerSender,
    timers: DashMap<PathKey, JoinHandle<()>>,
}

impl OplockBreaker {
    pub fn new(
        config: CacheConfig,
        transport: Arc<dyn BreakTransport>,
        workers: WorkerSender,
    ) -> Arc<Self> {
        Arc::new(Self { config, transport, workers, timers: DashMap::new() })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Sends the break request to the owning client.
    ///
    /// Called outside the per-state lock with the owner session and
    /// addressing captured under it. An I/O failure is reported to the
    /// caller, which treats it as an immediate break failure.
    pub async fn send_break(
        &self,
        session: &SessionRef,
        tree_id: u32,
        file_id: u32,
        new_level: OplockLevel,
    ) -> std::io::Result<()> {
        let packet = packet::break_request(tree_id, file_id, new_level);
        self.transport.send_break(session, packet).await
    }

    /// Starts the break timer for `path`.
    ///
    /// Until the timeout the task refreshes the deferred requests' buffer
    /// leases every half lease-window. At the timeout it asks `handler`
    /// to mark the oplock failed and, if the break was still pending,
    /// completes every deferred request with access-denied. Each buffer
    /// returns to its pool exactly once, by dropping the failed request.
    pub fn start_timer(
        self: &Arc<Self>,
        path: PathKey,
        queue: Arc<DeferredQueue>,
        handler: Arc<dyn BreakTimeoutHandler>,
    ) {
        let breaker = Arc::clone(self);
        let timer_path = path.clone();
        let handle = tokio::spawn(async move {
            breaker.run_timer(timer_path, queue, handler).await;
        });
        if let Some(previous) = self.timers.insert(path, handle) {
            previous.abort();
        }
    }

    async fn run_timer(
        self: Arc<Self>,
        path: PathKey,
        queue: Arc<DeferredQueue>,
        handler: Arc<dyn BreakTimeoutHandler>,
    ) {
        let deadline = tokio::time::Instant::now() + self.config.break_timeout;
        let refresh_every = (self.config.lease_window / 2).max(Duration::from_millis(100));

        loop {
            let tick = tokio::time::Instant::now() + refresh_every;
            if tick >= deadline {
                tokio::time::sleep_until(deadline).await;
                break;
            }
            tokio::time::sleep_until(tick).await;
            queue.refresh_leases(self.config.lease_window);
        }

        self.timers.remove(&path);

        if !handler.mark_break_failed(&path) {
            return;
        }
        if self.config.debug_enabled(DebugFlags::OPLOCK) {
            debug!(target: "smb_mamont::oplock", %path, "oplock break timed out");
        }
        self.fail_deferred(&queue).await;
    }

    /// Cancels the break timer for `path`, if one is pending.
    pub fn cancel_timer(&self, path: &PathKey) {
        if let Some((_, handle)) = self.timers.remove(path) {
            handle.abort();
        }
    }

    /// Tells whether a break timer is pending for `path`.
    pub fn timer_pending(&self, path: &PathKey) -> bool {
        self.timers.contains_key(path)
    }

    /// Completes every deferred request with access-denied.
    pub async fn fail_deferred(&self, queue: &DeferredQueue) -> usize {
        let failed = queue.drain();
        let count = failed.len();
        for request in failed {
            self.transport
                .fail_request(&request.session, request.message.payload(), &Error::AccessDenied)
                .await;
            // Dropping the request returns its buffer to the pool.
        }
        count
    }

    /// Requeues every deferred request to the worker pool in insertion
    /// order, restoring buffer ownership to the resumed request.
    ///
    /// A rejected enqueue fails that request with an I/O error and lets
    /// its buffer return to the pool.
    pub async fn requeue_deferred(&self, path: &PathKey, queue: &DeferredQueue) -> RequeueStats {
        self.cancel_timer(path);

        let mut stats = RequeueStats::default();
        for request in queue.drain() {
            stats.attempted += 1;
            let DeferredRequest { session, message, .. } = request;
            let resumed = ResumedRequest { path: path.clone(), session, message };
            match self.workers.try_send(resumed) {
                Ok(()) => stats.requeued += 1,
                Err(rejected) => {
                    let resumed = rejected.into_inner();
                    let error = Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "worker pool rejected resumed request",
                    ));
                    self.transport
                        .fail_request(&resumed.session, resumed.message.payload(), &error)
                        .await;
                }
            }
        }

        if self.config.debug_enabled(DebugFlags::OPLOCK) {
            debug!(
                target: "smb_mamont::oplock",
                %path,
                attempted = stats.attempted,
                requeued = stats.requeued,
                "deferred requests resumed"
            );
        }
        stats
    }
}

impl Drop for OplockBreaker {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
    }
}
