use crate::session::{NodeId, SessionId};
use crate::state::lock::{ByteRangeLock, LockList, LockOwner};

fn owner(session: u64, pid: u32) -> LockOwner {
    LockOwner { node: NodeId::local(), session: SessionId(session), process_id: pid }
}

fn lock(owner: LockOwner, offset: u64, length: u64, exclusive: bool) -> ByteRangeLock {
    ByteRangeLock { owner, offset, length, exclusive }
}

#[test]
fn cross_owner_overlap_conflicts() {
    let mut list = LockList::new();
    list.add(lock(owner(1, 100), 0, 1024, true)).expect("first lock");

    let result = list.add(lock(owner(2, 200), 512, 1536, true));
    assert!(matches!(result, Err(crate::error::Error::LockConflict)));
}

#[test]
fn disjoint_ranges_coexist() {
    let mut list = LockList::new();
    list.add(lock(owner(1, 100), 0, 1024, true)).expect("first");
    list.add(lock(owner(2, 200), 2048, 2048, true)).expect("disjoint");
    assert_eq!(list.len(), 2);
}

#[test]
fn same_owner_may_overlap() {
    let mut list = LockList::new();
    let me = owner(1, 100);
    list.add(lock(me.clone(), 0, 1024, true)).expect("first");
    list.add(lock(me, 512, 1024, false)).expect("self overlap");
}

#[test]
fn write_lock_blocks_other_owners_reads_and_writes() {
    let mut list = LockList::new();
    list.add(lock(owner(1, 100), 0, 4096, true)).expect("write lock");

    let other = owner(2, 200);
    assert!(!list.can_read(3000, 100, &other));
    assert!(!list.can_write(3000, 100, &other));
    assert!(list.can_read(4096, 100, &other));

    let holder = owner(1, 100);
    assert!(list.can_read(0, 4096, &holder));
    assert!(list.can_write(0, 4096, &holder));
}

#[test]
fn read_lock_blocks_only_other_owners_writes() {
    let mut list = LockList::new();
    list.add(lock(owner(1, 100), 0, 4096, false)).expect("read lock");

    let other = owner(2, 200);
    assert!(list.can_read(0, 100, &other));
    assert!(!list.can_write(0, 100, &other));
}

#[test]
fn remove_requires_exact_range() {
    let mut list = LockList::new();
    let me = owner(1, 100);
    list.add(lock(me.clone(), 0, 1024, true)).expect("lock");

    assert!(matches!(
        list.remove(&me, 0, 512),
        Err(crate::error::Error::NotLocked)
    ));
    list.remove(&me, 0, 1024).expect("exact remove");
    assert!(list.is_empty());
}

#[test]
fn remove_checks_owner() {
    let mut list = LockList::new();
    list.add(lock(owner(1, 100), 0, 1024, true)).expect("lock");
    assert!(matches!(
        list.remove(&owner(2, 200), 0, 1024),
        Err(crate::error::Error::NotLocked)
    ));
}

#[test]
fn zero_length_ranges_never_overlap() {
    let mut list = LockList::new();
    list.add(lock(owner(1, 100), 100, 0, true)).expect("zero length");
    list.add(lock(owner(2, 200), 0, 4096, true)).expect("covers the point");
    assert!(list.can_write(100, 0, &owner(3, 300)));
}

#[test]
fn node_departure_strips_only_that_nodes_locks() {
    let mut list = LockList::new();
    let remote = LockOwner {
        node: NodeId::new("n1"),
        session: SessionId(9),
        process_id: 1,
    };
    list.add(lock(remote, 0, 4096, true)).expect("remote lock");
    list.add(lock(owner(1, 100), 8192, 100, true)).expect("local lock");

    assert_eq!(list.remove_node_locks(&NodeId::new("n1")), 1);
    assert_eq!(list.len(), 1);
}
