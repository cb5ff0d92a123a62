//! Two-node loopback demo: an exclusive open on one node, a conflicting
//! open on the other, a break round-trip, and the resumed request landing
//! on the worker queue.
//!
//! Run with `cargo run --example loopback`.

mod grid;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use grid::LoopbackGrid;
use smb_mamont::access::{CreateDisposition, OpenParams};
use smb_mamont::breaker::{worker_queue, BreakTransport};
use smb_mamont::buffer::BufferPool;
use smb_mamont::cluster::{ClusterRuntime, ClusterStateCache};
use smb_mamont::config::ClusterConfig;
use smb_mamont::defer::DeferredRequest;
use smb_mamont::error::Error;
use smb_mamont::path::PathKey;
use smb_mamont::session::{NodeId, SessionId, SessionLiveness, SessionRef};
use smb_mamont::state::{FileStatus, OplockLevel, RequestedAccess, SharingMode};

/// Prints break traffic instead of writing SMB packets to sockets.
struct PrintTransport(&'static str);

#[async_trait]
impl BreakTransport for PrintTransport {
    async fn send_break(&self, session: &SessionRef, packet: Vec<u8>) -> std::io::Result<()> {
        info!(
            node = self.0,
            session = session.id().0,
            bytes = packet.len(),
            "break request written to client"
        );
        Ok(())
    }

    async fn fail_request(&self, session: &SessionRef, _message: &[u8], error: &Error) {
        info!(node = self.0, session = session.id().0, %error, "deferred request failed");
    }
}

fn open_params(node: &NodeId, session: u64, access: RequestedAccess, sharing: SharingMode, oplock: OplockLevel) -> OpenParams {
    OpenParams {
        access,
        sharing,
        disposition: CreateDisposition::OpenIf,
        directory: false,
        node: node.clone(),
        session: SessionId(session),
        process_id: session as u32,
        tree_id: 1,
        file_id: 0x4000 + session as u32,
        requested_oplock: oplock,
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> smb_mamont::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let grid = LoopbackGrid::new();
    let config = ClusterConfig::from_toml(
        r#"
        cluster_name = "demo"
        topic_name = "demo-states"
        debug = ["Oplock", "ClusterMessage", "RemoteTask"]
        "#,
    )?;

    let (workers, resumed) = worker_queue(32);

    let n1 = grid.join("n1", 60_000);
    let cache1 = ClusterStateCache::new(
        config.clone(),
        n1.clone(),
        Arc::new(PrintTransport("n1")),
        workers.clone(),
    )?;
    let _tasks1 = cache1.start();

    let n2 = grid.join("n2", 60_000);
    let cache2 = ClusterStateCache::new(
        config,
        n2.clone(),
        Arc::new(PrintTransport("n2")),
        workers,
    )?;
    let _tasks2 = cache2.start();

    let pool = BufferPool::new(
        NonZeroUsize::new(1024).expect("size"),
        NonZeroUsize::new(8).expect("count"),
    );
    let path = PathKey::normalize("\\share\\report.doc", false)?;

    // Client A on n1 opens exclusively.
    let liveness_a = SessionLiveness::new();
    let session_a = SessionRef::new(SessionId(1), n1.node_id().clone(), &liveness_a);
    let token_a = cache1
        .grant_access(
            &path,
            &open_params(
                n1.node_id(),
                1,
                RequestedAccess::ReadWrite,
                SharingMode::READ,
                OplockLevel::Exclusive,
            ),
            &session_a,
            FileStatus::FileExists,
            || unreachable!("first open cannot defer"),
        )
        .await?
        .completed();
    info!(oplock = ?token_a.granted_oplock, "client A holds the file");

    // Client B on n2 wants to read: the open defers behind A's oplock.
    let liveness_b = SessionLiveness::new();
    let session_b = SessionRef::new(SessionId(2), n2.node_id().clone(), &liveness_b);
    let outcome = cache2
        .grant_access(
            &path,
            &open_params(
                n2.node_id(),
                2,
                RequestedAccess::Read,
                SharingMode::READ_WRITE_DELETE,
                OplockLevel::None,
            ),
            &session_b,
            FileStatus::FileExists,
            || {
                let mut message = pool
                    .acquire(Duration::from_secs(5))
                    .expect("pool has buffers");
                message.fill(b"NTCreateAndX \\share\\report.doc");
                DeferredRequest::new(session_b.clone(), message)
            },
        )
        .await?;
    info!(deferred = outcome.is_deferred(), "client B's open suspended");

    // Let the break request reach n1, then have client A acknowledge by
    // lowering to a shared level.
    tokio::time::sleep(Duration::from_millis(100)).await;
    cache1.change_oplock_type(&path, OplockLevel::Level2).await?;

    let resumed_request = resumed.recv().await.expect("worker queue open");
    info!(
        path = %resumed_request.path,
        payload = ?std::str::from_utf8(resumed_request.message.payload()),
        "client B's open resumed on the worker pool"
    );

    let state = cache2.lookup(&path).await.expect("state");
    info!(
        open_count = state.open_count(),
        oplock = ?state.oplock().map(|info| info.level),
        "cluster state after the break"
    );

    Ok(())
}
