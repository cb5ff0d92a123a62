//! End-to-end oplock scenarios against the standalone cache.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, key, Client, Plumbing, RecordingTransport};
use smb_mamont::cache::LocalStateCache;
use smb_mamont::config::CacheConfig;
use smb_mamont::error::Error;
use smb_mamont::session::NodeId;
use smb_mamont::state::{FileStatus, OplockLevel, RequestedAccess, SharingMode};

struct Fixture {
    cache: Arc<LocalStateCache>,
    transport: Arc<RecordingTransport>,
    plumbing: Plumbing,
}

fn fixture(config: CacheConfig) -> Fixture {
    let transport = Arc::new(RecordingTransport::default());
    let plumbing = Plumbing::new();
    let cache = LocalStateCache::new(config, transport.clone(), plumbing.workers.clone());
    Fixture { cache, transport, plumbing }
}

fn quick_break_config() -> CacheConfig {
    let mut config = CacheConfig::default();
    config.break_timeout = Duration::from_millis(300);
    config.lease_window = Duration::from_millis(100);
    config
}

#[tokio::test]
async fn exclusive_open_then_conflicting_read_breaks_and_resumes() {
    let fixture = fixture(CacheConfig::default());
    let cache = &fixture.cache;
    let path = key("\\share\\f");

    let client_a = Client::new(NodeId::local(), 1);
    let client_b = Client::new(NodeId::local(), 2);

    // A opens read/write, tolerating readers, with an exclusive oplock.
    let token_a = cache
        .grant_access(
            &path,
            &client_a.open(RequestedAccess::ReadWrite, SharingMode::READ, OplockLevel::Exclusive),
            &client_a.session,
            FileStatus::FileExists,
            || unreachable!("first open cannot defer"),
        )
        .await
        .expect("grant A")
        .completed();
    assert_eq!(token_a.granted_oplock, OplockLevel::Exclusive);

    // B's read open defers behind A's oplock; a break request goes to A.
    let open_b = client_b.open(
        RequestedAccess::Read,
        SharingMode::READ_WRITE_DELETE,
        OplockLevel::None,
    );
    let outcome = cache
        .grant_access(&path, &open_b, &client_b.session, FileStatus::FileExists, || {
            fixture.plumbing.suspend(&client_b, b"open \\share\\f")
        })
        .await
        .expect("defer B");
    assert!(outcome.is_deferred());

    eventually("break request sent to A", || fixture.transport.breaks_sent() == 1).await;
    {
        let breaks = fixture.transport.breaks.lock().unwrap();
        assert_eq!(breaks[0].0, 1, "break addressed to A's session");
    }

    // A acknowledges by lowering to Level2; B's request is requeued.
    cache
        .change_oplock_type(&path, OplockLevel::Level2)
        .await
        .expect("ack");

    let resumed = fixture.plumbing.resumed.recv().await.expect("resumed request");
    assert_eq!(resumed.path, path);
    assert_eq!(resumed.message.payload(), b"open \\share\\f");

    // The dispatcher re-runs the resumed open; now it succeeds.
    let token_b = cache
        .grant_access(&path, &open_b, &client_b.session, FileStatus::FileExists, || {
            unreachable!("level2 oplock does not defer readers")
        })
        .await
        .expect("grant B")
        .completed();
    assert_eq!(token_b.granted_oplock, OplockLevel::None);

    let state = cache.lookup(&path).expect("state");
    assert_eq!(state.open_count(), 2);
    assert_eq!(state.sharing(), SharingMode::READ);
    assert_eq!(state.oplock().map(|info| info.level), Some(OplockLevel::Level2));
}

#[tokio::test(start_paused = true)]
async fn unanswered_break_times_out_and_suppresses_further_breaks() {
    let fixture = fixture(quick_break_config());
    let cache = &fixture.cache;
    let path = key("\\share\\f");

    let client_a = Client::new(NodeId::local(), 1);
    let client_b = Client::new(NodeId::local(), 2);
    let client_c = Client::new(NodeId::local(), 3);

    cache
        .grant_access(
            &path,
            &client_a.open(RequestedAccess::ReadWrite, SharingMode::READ, OplockLevel::Exclusive),
            &client_a.session,
            FileStatus::FileExists,
            || unreachable!("first open cannot defer"),
        )
        .await
        .expect("grant A");

    let pool_before = fixture.plumbing.pool.available();
    let outcome = cache
        .grant_access(
            &path,
            &client_b.open(RequestedAccess::Read, SharingMode::READ_WRITE_DELETE, OplockLevel::None),
            &client_b.session,
            FileStatus::FileExists,
            || fixture.plumbing.suspend(&client_b, b"doomed open"),
        )
        .await
        .expect("defer B");
    assert!(outcome.is_deferred());

    // A never responds: B's open fails with access denied and its buffer
    // returns to the pool exactly once.
    eventually("timeout failure delivered", || fixture.transport.denied_count() == 1).await;
    assert_eq!(fixture.plumbing.pool.available(), pool_before);

    let state = cache.lookup(&path).expect("state");
    let oplock = state.oplock().expect("oplock survives as break-failed");
    assert!(oplock.break_failed);

    // Further opens proceed as if A held no oplock: no new break request.
    let token_c = cache
        .grant_access(
            &path,
            &client_c.open(RequestedAccess::Read, SharingMode::READ_WRITE_DELETE, OplockLevel::None),
            &client_c.session,
            FileStatus::FileExists,
            || unreachable!("failed break suppresses deferral"),
        )
        .await
        .expect("grant C")
        .completed();
    assert_eq!(token_c.granted_oplock, OplockLevel::None);
    assert_eq!(fixture.transport.breaks_sent(), 1);
}

#[tokio::test]
async fn attributes_only_open_coexists_with_exclusive_oplock() {
    let fixture = fixture(CacheConfig::default());
    let cache = &fixture.cache;
    let path = key("\\share\\f");

    let client_a = Client::new(NodeId::local(), 1);
    let client_b = Client::new(NodeId::local(), 2);

    // A probes attributes first.
    let token_a = cache
        .grant_access(
            &path,
            &client_a.open(
                RequestedAccess::AttributesOnly,
                SharingMode::READ_WRITE_DELETE,
                OplockLevel::None,
            ),
            &client_a.session,
            FileStatus::FileExists,
            || unreachable!("attribute opens never defer"),
        )
        .await
        .expect("grant A")
        .completed();
    assert_eq!(token_a.granted_oplock, OplockLevel::None);

    // B still gets the exclusive oplock: A's presence is invisible.
    let token_b = cache
        .grant_access(
            &path,
            &client_b.open(RequestedAccess::ReadWrite, SharingMode::NONE, OplockLevel::Exclusive),
            &client_b.session,
            FileStatus::FileExists,
            || unreachable!("attribute opens trigger no break"),
        )
        .await
        .expect("grant B")
        .completed();
    assert_eq!(token_b.granted_oplock, OplockLevel::Exclusive);
    assert_eq!(fixture.transport.breaks_sent(), 0);

    let state = cache.lookup(&path).expect("state");
    assert_eq!(state.open_count(), 1, "attribute opens do not count");
}

#[tokio::test]
async fn deferred_queue_capacity_is_enforced_without_leaks() {
    let mut config = CacheConfig::default();
    config.max_deferred = 3;
    let fixture = fixture(config);
    let cache = &fixture.cache;
    let path = key("\\share\\f");

    let owner = Client::new(NodeId::local(), 1);
    cache
        .grant_access(
            &path,
            &owner.open(RequestedAccess::ReadWrite, SharingMode::READ, OplockLevel::Batch),
            &owner.session,
            FileStatus::FileExists,
            || unreachable!("first open cannot defer"),
        )
        .await
        .expect("grant owner");

    let pool_start = fixture.plumbing.pool.available();
    for id in 2..=4 {
        let waiter = Client::new(NodeId::local(), id);
        let outcome = cache
            .grant_access(
                &path,
                &waiter.open(RequestedAccess::Read, SharingMode::READ_WRITE_DELETE, OplockLevel::None),
                &waiter.session,
                FileStatus::FileExists,
                || fixture.plumbing.suspend(&waiter, b"queued"),
            )
            .await
            .expect("defer");
        assert!(outcome.is_deferred());
    }

    // Fourth conflicting open: the queue is full.
    let overflow = Client::new(NodeId::local(), 5);
    let result = cache
        .grant_access(
            &path,
            &overflow.open(RequestedAccess::Read, SharingMode::READ_WRITE_DELETE, OplockLevel::None),
            &overflow.session,
            FileStatus::FileExists,
            || fixture.plumbing.suspend(&overflow, b"overflow"),
        )
        .await;
    assert!(matches!(result, Err(Error::DeferFailed)));

    // The overflow buffer went straight back to the pool.
    assert_eq!(fixture.plumbing.pool.available(), pool_start - 3);

    // Resolve the break so the queued three drain cleanly.
    cache
        .change_oplock_type(&path, OplockLevel::None)
        .await
        .expect("clear");
    for _ in 0..3 {
        fixture.plumbing.resumed.recv().await.expect("resumed");
    }
}

#[tokio::test]
async fn release_resumes_waiters_when_owner_closes() {
    let fixture = fixture(CacheConfig::default());
    let cache = &fixture.cache;
    let path = key("\\share\\f");

    let owner = Client::new(NodeId::local(), 1);
    let waiter = Client::new(NodeId::local(), 2);

    let mut token = cache
        .grant_access(
            &path,
            &owner.open(RequestedAccess::ReadWrite, SharingMode::READ, OplockLevel::Exclusive),
            &owner.session,
            FileStatus::FileExists,
            || unreachable!("first open cannot defer"),
        )
        .await
        .expect("grant owner")
        .completed();

    cache
        .grant_access(
            &path,
            &waiter.open(RequestedAccess::Read, SharingMode::READ_WRITE_DELETE, OplockLevel::None),
            &waiter.session,
            FileStatus::FileExists,
            || fixture.plumbing.suspend(&waiter, b"waiting"),
        )
        .await
        .expect("defer waiter");

    // The owner's close acts as a break acknowledgement.
    let remaining = cache.release_access(&mut token).await.expect("release");
    assert_eq!(remaining, 0);

    let resumed = fixture.plumbing.resumed.recv().await.expect("resumed");
    assert_eq!(resumed.message.payload(), b"waiting");

    // Double release is a no-op.
    assert_eq!(cache.release_access(&mut token).await.expect("release again"), 0);

    let state = cache.lookup(&path).expect("state");
    assert!(state.oplock().is_none());
    state.check_invariants();
}
