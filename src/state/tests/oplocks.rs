use crate::session::{NodeId, SessionId, SessionLiveness, SessionRef};
use crate::state::oplock::{BreakState, LocalOplock, OplockInfo, OplockLevel, OplockOwner};

fn info(level: OplockLevel) -> OplockInfo {
    OplockInfo::new(
        level,
        OplockOwner {
            node: NodeId::local(),
            session: SessionId(1),
            process_id: 10,
            tree_id: 2,
            file_id: 0x4001,
        },
    )
}

fn record(level: OplockLevel) -> (SessionLiveness, LocalOplock) {
    let liveness = SessionLiveness::new();
    let session = SessionRef::new(SessionId(1), NodeId::local(), &liveness);
    (liveness, LocalOplock::new(info(level), session, 3))
}

#[test]
fn break_cycle_happy_path() {
    let (_liveness, mut oplock) = record(OplockLevel::Exclusive);
    assert_eq!(oplock.break_state(), BreakState::Held);

    assert!(oplock.start_break());
    assert!(oplock.is_breaking());

    // Exactly one transition per break cycle.
    assert!(!oplock.start_break());

    assert!(oplock.acknowledge());
    assert_eq!(oplock.break_state(), BreakState::Broken);
    assert!(!oplock.acknowledge());
}

#[test]
fn break_timeout_latches_failed() {
    let (_liveness, mut oplock) = record(OplockLevel::Batch);
    assert!(oplock.start_break());
    assert!(oplock.fail());
    assert!(oplock.break_failed());

    // A failed break suppresses any further cycle.
    assert!(!oplock.start_break());
    assert!(!oplock.acknowledge());
}

#[test]
fn acknowledged_break_rearms_at_the_lower_level() {
    let (_liveness, mut oplock) = record(OplockLevel::Exclusive);
    assert!(oplock.start_break());
    assert!(oplock.acknowledge());
    assert_eq!(oplock.break_state(), BreakState::Broken);

    oplock.lower_to(OplockLevel::Level2);
    assert_eq!(oplock.break_state(), BreakState::Held);
    assert_eq!(oplock.level(), OplockLevel::Level2);
    assert!(!oplock.info().break_in_progress);

    // The re-armed record can serve a fresh break cycle.
    assert!(oplock.start_break());
}

#[test]
fn fail_outside_break_is_rejected() {
    let (_liveness, mut oplock) = record(OplockLevel::Exclusive);
    assert!(!oplock.fail());
    assert!(!oplock.acknowledge());
}

#[test]
fn session_liveness_follows_anchor() {
    let (liveness, oplock) = record(OplockLevel::Exclusive);
    assert!(oplock.session().is_alive());
    drop(liveness);
    assert!(!oplock.session().is_alive());
}

#[test]
fn exclusive_levels() {
    assert!(OplockLevel::Exclusive.is_exclusive());
    assert!(OplockLevel::Batch.is_exclusive());
    assert!(!OplockLevel::Level2.is_exclusive());
    assert!(!OplockLevel::None.is_exclusive());
}

#[test]
fn ownership_test_matches_node_and_session() {
    let descriptor = info(OplockLevel::Exclusive);
    assert!(descriptor.owned_by(&NodeId::local(), SessionId(1)));
    assert!(!descriptor.owned_by(&NodeId::local(), SessionId(2)));
    assert!(!descriptor.owned_by(&NodeId::new("n2"), SessionId(1)));
}
