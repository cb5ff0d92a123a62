//! Shared fixtures for the state-cache integration tests.
#![allow(dead_code)]

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use smb_mamont::access::{CreateDisposition, OpenParams};
use smb_mamont::breaker::{worker_queue, BreakTransport, WorkerReceiver, WorkerSender};
use smb_mamont::buffer::BufferPool;
use smb_mamont::defer::DeferredRequest;
use smb_mamont::error::Error;
use smb_mamont::path::PathKey;
use smb_mamont::session::{NodeId, SessionId, SessionLiveness, SessionRef};
use smb_mamont::state::{OplockLevel, RequestedAccess, SharingMode};

/// Break transport recording everything the cache sends toward clients.
#[derive(Default)]
pub struct RecordingTransport {
    pub breaks: Mutex<Vec<(u64, Vec<u8>)>>,
    pub denied: AtomicUsize,
    pub io_failures: AtomicUsize,
}

impl RecordingTransport {
    pub fn breaks_sent(&self) -> usize {
        self.breaks.lock().unwrap().len()
    }

    pub fn denied_count(&self) -> usize {
        self.denied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BreakTransport for RecordingTransport {
    async fn send_break(&self, session: &SessionRef, packet: Vec<u8>) -> std::io::Result<()> {
        self.breaks.lock().unwrap().push((session.id().0, packet));
        Ok(())
    }

    async fn fail_request(&self, _session: &SessionRef, _message: &[u8], error: &Error) {
        match error {
            Error::AccessDenied => {
                self.denied.fetch_add(1, Ordering::SeqCst);
            }
            _ => {
                self.io_failures.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

/// One simulated client connection: a session with its liveness anchor.
pub struct Client {
    pub session: SessionRef,
    pub node: NodeId,
    pub id: SessionId,
    _liveness: SessionLiveness,
}

impl Client {
    pub fn new(node: NodeId, id: u64) -> Self {
        let liveness = SessionLiveness::new();
        let id = SessionId(id);
        let session = SessionRef::new(id, node.clone(), &liveness);
        Self { session, node, id, _liveness: liveness }
    }

    /// Open parameters for this client.
    pub fn open(
        &self,
        access: RequestedAccess,
        sharing: SharingMode,
        oplock: OplockLevel,
    ) -> OpenParams {
        OpenParams {
            access,
            sharing,
            disposition: CreateDisposition::OpenIf,
            directory: false,
            node: self.node.clone(),
            session: self.id,
            process_id: self.id.0 as u32,
            tree_id: 1,
            file_id: 0x4000 + self.id.0 as u32,
            requested_oplock: oplock,
        }
    }
}

/// Shared buffer pool plus the worker-pool queue ends.
pub struct Plumbing {
    pub pool: BufferPool,
    pub workers: WorkerSender,
    pub resumed: WorkerReceiver,
}

impl Plumbing {
    pub fn new() -> Self {
        let (workers, resumed) = worker_queue(32);
        let pool = BufferPool::new(
            NonZeroUsize::new(1024).unwrap(),
            NonZeroUsize::new(16).unwrap(),
        );
        Self { pool, workers, resumed }
    }

    /// Materializes a deferred request for `client` carrying `payload`.
    pub fn suspend(&self, client: &Client, payload: &[u8]) -> DeferredRequest {
        let mut message = self
            .pool
            .acquire(Duration::from_secs(5))
            .expect("buffer pool exhausted");
        message.fill(payload);
        DeferredRequest::new(client.session.clone(), message)
    }
}

pub fn key(raw: &str) -> PathKey {
    PathKey::normalize(raw, false).expect("key")
}

/// Polls `probe` until it returns true or the deadline passes.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut probe: F) {
    for _ in 0..200 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}
