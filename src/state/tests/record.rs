use crate::clock;
use crate::path::PathKey;
use crate::session::{NodeId, SessionId};
use crate::state::attr::AttrValue;
use crate::state::{FileState, FileStatus, OwnerId, SharingMode};

fn state(path: &str) -> FileState {
    let key = PathKey::normalize(path, false).expect("key");
    FileState::new(key, FileStatus::FileExists, 60_000)
}

fn opener(session: u64) -> OwnerId {
    OwnerId { node: NodeId::local(), session: SessionId(session) }
}

#[test]
fn fresh_state_has_full_sharing() {
    let state = state("\\share\\f");
    assert_eq!(state.open_count(), 0);
    assert_eq!(state.sharing(), SharingMode::READ_WRITE_DELETE);
    assert!(state.primary_owner().is_none());
    assert!(state.oplock().is_none());
    state.check_invariants();
}

#[test]
fn first_open_installs_sharing_and_owner() {
    let mut state = state("\\share\\f");
    state.record_open(opener(1), SharingMode::READ);
    assert_eq!(state.open_count(), 1);
    assert_eq!(state.sharing(), SharingMode::READ);
    assert_eq!(state.primary_owner(), Some(&opener(1)));
}

#[test]
fn later_opens_narrow_sharing() {
    let mut state = state("\\share\\f");
    state.record_open(opener(1), SharingMode::READ.union(SharingMode::WRITE));
    state.record_open(opener(2), SharingMode::READ_WRITE_DELETE);
    assert_eq!(state.sharing(), SharingMode::READ.union(SharingMode::WRITE));
    assert_eq!(state.primary_owner(), Some(&opener(1)));
    assert_eq!(state.open_count(), 2);
}

#[test]
fn last_close_restores_zero_open_invariant() {
    let mut state = state("\\share\\f");
    state.record_open(opener(1), SharingMode::READ);
    state.record_open(opener(2), SharingMode::READ);

    assert_eq!(state.record_close(&NodeId::local()), 1);
    assert_eq!(state.sharing(), SharingMode::READ);

    assert_eq!(state.record_close(&NodeId::local()), 0);
    assert_eq!(state.sharing(), SharingMode::READ_WRITE_DELETE);
    assert!(state.primary_owner().is_none());
    state.check_invariants();
}

#[test]
fn not_exist_clears_identity_and_attributes() {
    let mut state = state("\\share\\f");
    state.set_file_id(42);
    state.attrs_mut().set("meta", AttrValue::U64(7));

    state.set_status(FileStatus::NotExist);
    assert_eq!(state.file_id(), None);
    assert!(state.attrs().is_empty());
    state.check_invariants();
}

#[test]
fn open_pins_state_against_expiry() {
    let mut state = state("\\share\\f");
    state.record_open(opener(1), SharingMode::READ);
    let far_future = clock::now_millis() + 1_000_000;
    assert!(!state.is_expired(far_future));

    state.record_close(&NodeId::local());
    assert!(state.is_expired(far_future));
}

#[test]
fn departed_node_opens_are_reclaimed() {
    let mut state = state("\\share\\f");
    let remote = OwnerId { node: NodeId::new("n1"), session: SessionId(4) };
    state.record_open(remote.clone(), SharingMode::READ);
    state.record_open(remote, SharingMode::READ);
    state.record_open(opener(1), SharingMode::READ);
    assert_eq!(state.open_count(), 3);

    assert_eq!(state.forget_node_opens(&NodeId::new("n1")), 1);
    // The departed node was primary owner: ownership and sharing reset.
    assert!(state.primary_owner().is_none());
    assert_eq!(state.sharing(), SharingMode::READ_WRITE_DELETE);

    assert_eq!(state.forget_node_opens(&NodeId::local()), 0);
    state.check_invariants();
}

#[test]
fn permanent_state_never_expires() {
    let mut state = state("\\share\\f");
    state.set_permanent(true);
    assert!(!state.is_expired(u64::MAX));
}

#[test]
fn repoint_clears_attribute_bag() {
    let mut state = state("\\x\\a");
    state.attrs_mut().set("meta", AttrValue::Text("cached".to_owned()));

    let new_key = PathKey::normalize("\\y\\a", false).expect("key");
    state.repoint(new_key.clone());
    assert_eq!(state.path(), &new_key);
    assert!(state.attrs().is_empty());
}

#[test]
fn state_round_trips_through_serde() {
    let mut state = state("\\share\\f");
    state.set_file_id(99);
    state.record_open(opener(3), SharingMode::READ);
    state.attrs_mut().set("segment", AttrValue::Segment {
        offset: 0,
        length: 4096,
        store_path: "seg-000".to_owned(),
    });

    let encoded = serde_json::to_string(&state).expect("encode");
    let decoded: FileState = serde_json::from_str(&encoded).expect("decode");
    assert_eq!(decoded.path(), state.path());
    assert_eq!(decoded.open_count(), 1);
    assert_eq!(decoded.file_id(), Some(99));
    assert_eq!(decoded.sharing(), SharingMode::READ);
}
