//! Defines the per-path file state record --- [`FileState`] --- and the
//! access/sharing vocabulary the arbiter decides over.

pub mod attr;
pub mod lock;
pub mod oplock;

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::path::PathKey;
use crate::session::{NodeId, SessionId};

pub use attr::{AttrBag, AttrValue};
pub use lock::{ByteRangeLock, LockList, LockOwner};
pub use oplock::{OplockInfo, OplockLevel, OplockOwner};

/// Status of the filesystem object behind a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
pub enum FileStatus {
    /// No probe result has been recorded yet.
    Unknown = 0,
    /// The backing filesystem reported the path absent.
    NotExist = 1,
    /// A regular file exists at the path.
    FileExists = 2,
    /// A directory exists at the path.
    DirectoryExists = 3,
}

impl FileStatus {
    /// Tells whether the status asserts the object's presence.
    pub fn exists(self) -> bool {
        matches!(self, FileStatus::FileExists | FileStatus::DirectoryExists)
    }
}

/// Access kind requested by an open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
pub enum RequestedAccess {
    /// Metadata-only open. Never conflicts with sharing modes and never
    /// consumes share bits.
    AttributesOnly = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl RequestedAccess {
    /// Share bits the access consumes from the file's sharing mode.
    pub fn share_bits(self) -> SharingMode {
        match self {
            RequestedAccess::AttributesOnly => SharingMode::NONE,
            RequestedAccess::Read => SharingMode::READ,
            RequestedAccess::Write => SharingMode::WRITE,
            RequestedAccess::ReadWrite => SharingMode::READ.union(SharingMode::WRITE),
        }
    }

    pub fn is_attributes_only(self) -> bool {
        matches!(self, RequestedAccess::AttributesOnly)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, RequestedAccess::Write | RequestedAccess::ReadWrite)
    }
}

/// What an open will tolerate from additional openers of the same file.
///
/// Bit set over read, write and delete access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingMode(u8);

impl SharingMode {
    pub const NONE: SharingMode = SharingMode(0);
    pub const READ: SharingMode = SharingMode(0x1);
    pub const WRITE: SharingMode = SharingMode(0x2);
    pub const DELETE: SharingMode = SharingMode(0x4);
    /// Sharing mode of a file with no opens.
    pub const READ_WRITE_DELETE: SharingMode = SharingMode(0x7);

    /// Tells whether every bit of `access` is granted.
    pub fn allows(self, access: SharingMode) -> bool {
        self.0 & access.0 == access.0
    }

    /// Bits granted by both modes.
    pub fn intersect(self, other: SharingMode) -> SharingMode {
        SharingMode(self.0 & other.0)
    }

    /// Bits granted by either mode.
    pub fn union(self, other: SharingMode) -> SharingMode {
        SharingMode(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Identity of an opener: the session and the node it is connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerId {
    pub node: NodeId,
    pub session: SessionId,
}

/// Per-path record coordinating every open of a file across the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    path: PathKey,
    status: FileStatus,
    file_id: Option<u64>,
    open_count: u32,
    /// Opens per node, so a departing cluster member's share of the count
    /// can be reclaimed.
    opens_by_node: HashMap<NodeId, u32>,
    sharing: SharingMode,
    primary_owner: Option<OwnerId>,
    locks: LockList,
    oplock: Option<OplockInfo>,
    attrs: AttrBag,
    /// Milliseconds since epoch after which the state may be reaped.
    expires_at: u64,
    permanent: bool,
    data_update_node: Option<NodeId>,
}

impl FileState {
    /// Creates a state for `path` with the given probe result, expiring
    /// `ttl_millis` from now unless pinned by opens.
    pub fn new(path: PathKey, status: FileStatus, ttl_millis: u64) -> Self {
        Self {
            path,
            status,
            file_id: None,
            open_count: 0,
            opens_by_node: HashMap::new(),
            sharing: SharingMode::READ_WRITE_DELETE,
            primary_owner: None,
            locks: LockList::new(),
            oplock: None,
            attrs: AttrBag::new(),
            expires_at: clock::now_millis() + ttl_millis,
            permanent: false,
            data_update_node: None,
        }
    }

    pub fn path(&self) -> &PathKey {
        &self.path
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    /// Records a probe or broadcast status, keeping the data-model
    /// invariant that absent files carry no identity or attributes.
    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
        if status == FileStatus::NotExist {
            self.file_id = None;
            self.attrs.clear();
        }
    }

    pub fn file_id(&self) -> Option<u64> {
        self.file_id
    }

    pub fn set_file_id(&mut self, file_id: u64) {
        self.file_id = Some(file_id);
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub fn sharing(&self) -> SharingMode {
        self.sharing
    }

    pub fn primary_owner(&self) -> Option<&OwnerId> {
        self.primary_owner.as_ref()
    }

    pub fn locks(&self) -> &LockList {
        &self.locks
    }

    pub fn locks_mut(&mut self) -> &mut LockList {
        &mut self.locks
    }

    pub fn oplock(&self) -> Option<&OplockInfo> {
        self.oplock.as_ref()
    }

    pub fn oplock_mut(&mut self) -> Option<&mut OplockInfo> {
        self.oplock.as_mut()
    }

    pub fn attrs(&self) -> &AttrBag {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut AttrBag {
        &mut self.attrs
    }

    pub fn data_update_node(&self) -> Option<&NodeId> {
        self.data_update_node.as_ref()
    }

    pub fn set_data_update_node(&mut self, node: Option<NodeId>) {
        self.data_update_node = node;
    }

    /// Marks the state as never eligible for reaping.
    pub fn set_permanent(&mut self, permanent: bool) {
        self.permanent = permanent;
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    /// Pushes the expiry deadline to `ttl_millis` from now.
    pub fn touch(&mut self, ttl_millis: u64) {
        self.expires_at = clock::now_millis() + ttl_millis;
    }

    /// Tells whether the state may be reaped at `now_millis`.
    pub fn is_expired(&self, now_millis: u64) -> bool {
        !self.permanent && self.open_count == 0 && self.expires_at < now_millis
    }

    /// Books one granted open: first opener installs the sharing mode and
    /// becomes primary owner, later openers narrow the mode.
    pub fn record_open(&mut self, owner: OwnerId, sharing: SharingMode) {
        *self.opens_by_node.entry(owner.node.clone()).or_insert(0) += 1;
        if self.open_count == 0 {
            self.sharing = sharing;
            self.primary_owner = Some(owner);
        } else {
            self.sharing = self.sharing.intersect(sharing);
        }
        self.open_count += 1;
    }

    /// Reverses one open's bookkeeping. Returns the remaining open count.
    ///
    /// The last close restores the zero-open invariant: full sharing, no
    /// primary owner, no oplock, no byte-range locks.
    pub fn record_close(&mut self, node: &NodeId) -> u32 {
        debug_assert!(self.open_count > 0, "close without open");
        self.open_count = self.open_count.saturating_sub(1);
        if let Some(count) = self.opens_by_node.get_mut(node) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.opens_by_node.remove(node);
            }
        }
        if self.open_count == 0 {
            self.reset_open_state();
        }
        self.open_count
    }

    /// Restores the fields tied to having at least one open.
    pub fn reset_open_state(&mut self) {
        self.sharing = SharingMode::READ_WRITE_DELETE;
        self.primary_owner = None;
        self.oplock = None;
        self.locks.clear();
        self.opens_by_node.clear();
    }

    /// Reclaims every open held through `node`. Returns the remaining
    /// open count. Used when a cluster member departs.
    pub fn forget_node_opens(&mut self, node: &NodeId) -> u32 {
        let held = self.opens_by_node.remove(node).unwrap_or(0);
        self.open_count = self.open_count.saturating_sub(held);
        if self
            .primary_owner
            .as_ref()
            .is_some_and(|owner| owner.node == *node)
        {
            self.primary_owner = None;
            self.sharing = SharingMode::READ_WRITE_DELETE;
        }
        if self.open_count == 0 {
            self.reset_open_state();
        }
        self.open_count
    }

    /// Attaches an oplock descriptor. Fails when one is already present.
    pub fn set_oplock(&mut self, info: OplockInfo) -> crate::error::Result<()> {
        if self.oplock.is_some() {
            return Err(crate::error::Error::ExistingOpLock);
        }
        self.oplock = Some(info);
        Ok(())
    }

    /// Replaces the oplock level in place, clearing the record entirely
    /// when the new level is `None`.
    pub fn change_oplock_level(&mut self, level: OplockLevel) {
        if level == OplockLevel::None {
            self.oplock = None;
        } else if let Some(info) = &mut self.oplock {
            info.level = level;
        }
    }

    pub fn clear_oplock(&mut self) -> Option<OplockInfo> {
        self.oplock.take()
    }

    /// Repoints the state at a new path, dropping the attribute bag. Used
    /// by rename, which reinstates the record under the new key.
    pub fn repoint(&mut self, path: PathKey) {
        self.path = path;
        self.attrs.clear();
    }

    /// Debug-only structural invariant check.
    pub fn check_invariants(&self) {
        if self.open_count == 0 {
            debug_assert_eq!(self.sharing, SharingMode::READ_WRITE_DELETE);
            debug_assert!(self.primary_owner.is_none());
            debug_assert!(self.oplock.is_none());
            debug_assert!(self.locks.is_empty());
        }
        if self.status == FileStatus::NotExist {
            debug_assert!(self.file_id.is_none());
            debug_assert!(self.attrs.is_empty());
        }
    }
}
