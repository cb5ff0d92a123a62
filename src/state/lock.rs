//! Defines byte-range locks held on a file state --- [`LockList`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::{NodeId, SessionId};

/// Identity of a byte-range lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub node: NodeId,
    pub session: SessionId,
    pub process_id: u32,
}

/// One byte-range lock.
///
/// The exclusive flag distinguishes write locks (forbid read and write by
/// others) from shared read locks (forbid write by others).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByteRangeLock {
    pub owner: LockOwner,
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
}

impl ByteRangeLock {
    /// Tells whether two ranges share at least one byte. Zero-length
    /// ranges overlap nothing.
    fn overlaps_range(&self, offset: u64, length: u64) -> bool {
        if self.length == 0 || length == 0 {
            return false;
        }
        let own_end = self.offset.saturating_add(self.length);
        let other_end = offset.saturating_add(length);
        self.offset < other_end && offset < own_end
    }
}

/// Ordered set of byte-range locks held on one file state.
///
/// Ranges may overlap for the same owner but never across owners.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockList(Vec<ByteRangeLock>);

impl LockList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRangeLock> {
        self.0.iter()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Adds a lock, failing when its range overlaps a different owner's.
    pub fn add(&mut self, lock: ByteRangeLock) -> Result<()> {
        let conflict = self.0.iter().any(|held| {
            held.owner != lock.owner && held.overlaps_range(lock.offset, lock.length)
        });
        if conflict {
            return Err(Error::LockConflict);
        }
        let position = self
            .0
            .partition_point(|held| (held.offset, held.length) <= (lock.offset, lock.length));
        self.0.insert(position, lock);
        Ok(())
    }

    /// Removes the owner's lock with the exact range.
    pub fn remove(&mut self, owner: &LockOwner, offset: u64, length: u64) -> Result<ByteRangeLock> {
        let position = self
            .0
            .iter()
            .position(|held| held.owner == *owner && held.offset == offset && held.length == length)
            .ok_or(Error::NotLocked)?;
        Ok(self.0.remove(position))
    }

    /// Tells whether `owner` may read the range: false iff a different
    /// owner holds an overlapping exclusive lock.
    pub fn can_read(&self, offset: u64, length: u64, owner: &LockOwner) -> bool {
        !self.0.iter().any(|held| {
            held.owner != *owner && held.exclusive && held.overlaps_range(offset, length)
        })
    }

    /// Tells whether `owner` may write the range: false iff a different
    /// owner holds any overlapping lock.
    pub fn can_write(&self, offset: u64, length: u64, owner: &LockOwner) -> bool {
        !self
            .0
            .iter()
            .any(|held| held.owner != *owner && held.overlaps_range(offset, length))
    }

    /// Drops every lock whose owner matches the predicate. Returns how
    /// many were removed.
    pub fn remove_owned_by(&mut self, mut predicate: impl FnMut(&LockOwner) -> bool) -> usize {
        let before = self.0.len();
        self.0.retain(|held| !predicate(&held.owner));
        before - self.0.len()
    }

    /// Drops every lock held from the given node. Used when a cluster
    /// member departs.
    pub fn remove_node_locks(&mut self, node: &NodeId) -> usize {
        self.remove_owned_by(|owner| owner.node == *node)
    }

    /// Drops every lock held by the given session.
    pub fn remove_session_locks(&mut self, node: &NodeId, session: SessionId) -> usize {
        self.remove_owned_by(|owner| owner.node == *node && owner.session == session)
    }
}
