use crate::access::{
    decide_open, release_open, AccessToken, CreateDisposition, Decision, OpenAction, OpenParams,
};
use crate::error::Error;
use crate::path::PathKey;
use crate::session::{NodeId, SessionId};
use crate::state::{FileState, FileStatus, OplockLevel, RequestedAccess, SharingMode};

fn state(status: FileStatus) -> FileState {
    let key = PathKey::normalize("\\share\\f", false).expect("key");
    FileState::new(key, status, 60_000)
}

fn params(session: u64, access: RequestedAccess, sharing: SharingMode) -> OpenParams {
    OpenParams {
        access,
        sharing,
        disposition: CreateDisposition::OpenIf,
        directory: false,
        node: NodeId::local(),
        session: SessionId(session),
        process_id: session as u32,
        tree_id: 1,
        file_id: 0x4000 + session as u32,
        requested_oplock: OplockLevel::None,
    }
}

fn grant(state: &mut FileState, open: &OpenParams) -> AccessToken {
    match decide_open(state, open, FileStatus::Unknown).expect("decision") {
        Decision::Granted(token) => token,
        Decision::Deferred(_) => panic!("unexpected deferral"),
    }
}

#[test]
fn disposition_open_requires_existing_file() {
    let mut state = state(FileStatus::NotExist);
    let mut open = params(1, RequestedAccess::Read, SharingMode::READ_WRITE_DELETE);
    open.disposition = CreateDisposition::Open;
    assert!(matches!(
        decide_open(&mut state, &open, FileStatus::Unknown),
        Err(Error::FileNotFound)
    ));
}

#[test]
fn disposition_create_rejects_existing_file() {
    let mut state = state(FileStatus::FileExists);
    let mut open = params(1, RequestedAccess::Write, SharingMode::READ_WRITE_DELETE);
    open.disposition = CreateDisposition::Create;
    assert!(matches!(
        decide_open(&mut state, &open, FileStatus::Unknown),
        Err(Error::FileExists)
    ));
}

#[test]
fn disposition_create_on_missing_file_creates() {
    let mut state = state(FileStatus::NotExist);
    let mut open = params(1, RequestedAccess::Write, SharingMode::READ_WRITE_DELETE);
    open.disposition = CreateDisposition::Create;
    let token = grant(&mut state, &open);
    assert_eq!(token.action, OpenAction::Created);
    assert_eq!(state.status(), FileStatus::FileExists);
}

#[test]
fn probe_result_overrides_cached_status() {
    let mut state = state(FileStatus::NotExist);
    let mut open = params(1, RequestedAccess::Read, SharingMode::READ_WRITE_DELETE);
    open.disposition = CreateDisposition::Open;
    match decide_open(&mut state, &open, FileStatus::FileExists).expect("decision") {
        Decision::Granted(token) => assert_eq!(token.action, OpenAction::Opened),
        Decision::Deferred(_) => panic!("unexpected deferral"),
    }
}

#[test]
fn first_open_grants_exclusive_oplock_inline() {
    let mut state = state(FileStatus::FileExists);
    let mut open = params(1, RequestedAccess::ReadWrite, SharingMode::READ);
    open.requested_oplock = OplockLevel::Exclusive;

    let token = grant(&mut state, &open);
    assert_eq!(token.granted_oplock, OplockLevel::Exclusive);
    assert_eq!(state.oplock().map(|info| info.level), Some(OplockLevel::Exclusive));
    assert_eq!(state.open_count(), 1);
}

#[test]
fn second_open_cannot_get_exclusive_oplock() {
    let mut state = state(FileStatus::FileExists);
    grant(&mut state, &params(1, RequestedAccess::Read, SharingMode::READ_WRITE_DELETE));

    let mut second = params(2, RequestedAccess::Read, SharingMode::READ_WRITE_DELETE);
    second.requested_oplock = OplockLevel::Batch;
    let token = grant(&mut state, &second);
    assert_eq!(token.granted_oplock, OplockLevel::None);
}

#[test]
fn sharing_violation_when_access_not_tolerated() {
    let mut state = state(FileStatus::FileExists);
    grant(&mut state, &params(1, RequestedAccess::ReadWrite, SharingMode::READ));

    // First opener tolerates reads only; a write open violates.
    let write = params(2, RequestedAccess::Write, SharingMode::READ_WRITE_DELETE);
    assert!(matches!(
        decide_open(&mut state, &write, FileStatus::Unknown),
        Err(Error::SharingViolation)
    ));
}

#[test]
fn sharing_narrows_to_intersection() {
    let mut state = state(FileStatus::FileExists);
    grant(&mut state, &params(1, RequestedAccess::Read, SharingMode::READ.union(SharingMode::WRITE)));
    grant(&mut state, &params(2, RequestedAccess::Read, SharingMode::READ));
    assert_eq!(state.sharing(), SharingMode::READ);
    assert_eq!(state.open_count(), 2);
}

#[test]
fn conflicting_open_defers_and_flips_break_flag() {
    let mut state = state(FileStatus::FileExists);
    let mut first = params(1, RequestedAccess::ReadWrite, SharingMode::READ);
    first.requested_oplock = OplockLevel::Exclusive;
    grant(&mut state, &first);

    let second = params(2, RequestedAccess::Read, SharingMode::READ_WRITE_DELETE);
    match decide_open(&mut state, &second, FileStatus::Unknown).expect("decision") {
        Decision::Deferred(required) => {
            assert!(required.initiated);
            assert_eq!(required.oplock.owner.session, SessionId(1));
        }
        Decision::Granted(_) => panic!("expected deferral"),
    }
    assert!(state.oplock().expect("oplock").break_in_progress);

    // A third conflicting open joins the same break cycle.
    let third = params(3, RequestedAccess::Read, SharingMode::READ_WRITE_DELETE);
    match decide_open(&mut state, &third, FileStatus::Unknown).expect("decision") {
        Decision::Deferred(required) => assert!(!required.initiated),
        Decision::Granted(_) => panic!("expected deferral"),
    }
}

#[test]
fn attributes_only_never_defers_nor_counts() {
    let mut state = state(FileStatus::FileExists);
    let mut first = params(1, RequestedAccess::ReadWrite, SharingMode::NONE);
    first.requested_oplock = OplockLevel::Batch;
    grant(&mut state, &first);

    // Sharing mode NONE and a standing batch oplock: a normal open would
    // fail or defer, an attribute open sails through.
    let probe = params(2, RequestedAccess::AttributesOnly, SharingMode::READ_WRITE_DELETE);
    let token = grant(&mut state, &probe);
    assert_eq!(token.granted_oplock, OplockLevel::None);
    assert_eq!(state.open_count(), 1);
    assert!(!state.oplock().expect("oplock").break_in_progress);
}

#[test]
fn attributes_only_before_exclusive_grant() {
    let mut state = state(FileStatus::FileExists);
    grant(&mut state, &params(1, RequestedAccess::AttributesOnly, SharingMode::READ_WRITE_DELETE));

    let mut second = params(2, RequestedAccess::ReadWrite, SharingMode::NONE);
    second.requested_oplock = OplockLevel::Exclusive;
    let token = grant(&mut state, &second);
    assert_eq!(token.granted_oplock, OplockLevel::Exclusive);
}

#[test]
fn level2_oplock_does_not_block_readers() {
    let mut state = state(FileStatus::FileExists);
    let mut first = params(1, RequestedAccess::Read, SharingMode::READ_WRITE_DELETE);
    first.requested_oplock = OplockLevel::Level2;
    grant(&mut state, &first);

    let reader = params(2, RequestedAccess::Read, SharingMode::READ_WRITE_DELETE);
    grant(&mut state, &reader);
    assert_eq!(state.open_count(), 2);
}

#[test]
fn level2_oplock_breaks_on_writer() {
    let mut state = state(FileStatus::FileExists);
    let mut first = params(1, RequestedAccess::Read, SharingMode::READ_WRITE_DELETE);
    first.requested_oplock = OplockLevel::Level2;
    grant(&mut state, &first);

    let writer = params(2, RequestedAccess::Write, SharingMode::READ_WRITE_DELETE);
    match decide_open(&mut state, &writer, FileStatus::Unknown).expect("decision") {
        Decision::Deferred(required) => assert!(required.initiated),
        Decision::Granted(_) => panic!("expected deferral"),
    }
}

#[test]
fn failed_break_suppresses_further_breaks() {
    let mut state = state(FileStatus::FileExists);
    let mut first = params(1, RequestedAccess::ReadWrite, SharingMode::READ);
    first.requested_oplock = OplockLevel::Exclusive;
    grant(&mut state, &first);

    if let Some(info) = state.oplock_mut() {
        info.break_in_progress = false;
        info.break_failed = true;
    }

    let second = params(2, RequestedAccess::Read, SharingMode::READ_WRITE_DELETE);
    grant(&mut state, &second);
    assert_eq!(state.open_count(), 2);
}

#[test]
fn release_is_idempotent() {
    let mut state = state(FileStatus::FileExists);
    let mut token = grant(&mut state, &params(1, RequestedAccess::Read, SharingMode::READ));
    assert_eq!(release_open(&mut state, &mut token), 0);
    assert_eq!(release_open(&mut state, &mut token), 0);
    state.check_invariants();
}

#[test]
fn owner_close_clears_its_oplock() {
    let mut state = state(FileStatus::FileExists);
    let mut first = params(1, RequestedAccess::ReadWrite, SharingMode::READ);
    first.requested_oplock = OplockLevel::Exclusive;
    let mut token = grant(&mut state, &first);

    release_open(&mut state, &mut token);
    assert!(state.oplock().is_none());
}
