//! Defines oplock descriptors and the per-node break state machine.

use std::sync::Arc;
use std::time::Instant;

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::defer::DeferredQueue;
use crate::session::{NodeId, SessionId, SessionRef};

/// Opportunistic lock level granted to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
pub enum OplockLevel {
    /// No oplock.
    None = 0,
    /// Shared-read caching by any number of clients; no writes.
    Level2 = 1,
    /// Single-client read/write caching.
    Exclusive = 2,
    /// Exclusive caching plus delayed close.
    Batch = 3,
}

impl OplockLevel {
    /// Tells whether the level grants exclusive caching.
    pub fn is_exclusive(self) -> bool {
        matches!(self, OplockLevel::Exclusive | OplockLevel::Batch)
    }
}

/// Identity of an oplock owner, precise enough to address the break
/// request back to the owning handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplockOwner {
    pub node: NodeId,
    pub session: SessionId,
    pub process_id: u32,
    pub tree_id: u32,
    /// Dispatcher file id (FID) of the owning handle.
    pub file_id: u32,
}

/// Serializable oplock descriptor stored inside a [`crate::state::FileState`].
///
/// Carries the break flags every node must observe; the break machinery
/// (timers, deferred queue, owner socket) never crosses the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplockInfo {
    pub level: OplockLevel,
    pub owner: OplockOwner,
    /// A break request has been issued and not yet resolved.
    pub break_in_progress: bool,
    /// A break timed out; opens proceed as if the oplock were absent.
    pub break_failed: bool,
}

impl OplockInfo {
    pub fn new(level: OplockLevel, owner: OplockOwner) -> Self {
        Self { level, owner, break_in_progress: false, break_failed: false }
    }

    /// Tells whether the oplock is owned by the given session.
    pub fn owned_by(&self, node: &NodeId, session: SessionId) -> bool {
        self.owner.node == *node && self.owner.session == session
    }

    /// Tells whether the oplock still stands in the way of other openers.
    pub fn is_effective(&self) -> bool {
        !self.break_failed && self.level != OplockLevel::None
    }
}

/// Break progress of one oplock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakState {
    /// Granted, no break underway.
    Held,
    /// A break request has been issued to the owner.
    InProgress,
    /// The owner acknowledged by lowering its level or closing.
    Broken,
    /// The break timed out. Further breaks are suppressed and opens
    /// proceed as if the oplock were absent.
    Failed,
}

/// Per-node oplock record: the descriptor plus the break machinery bound
/// to the owner's socket and to locally queued requests.
pub struct LocalOplock {
    info: OplockInfo,
    break_state: BreakState,
    break_sent_at: Option<Instant>,
    deferred: Arc<DeferredQueue>,
    session: SessionRef,
}

impl LocalOplock {
    /// Creates a record in the `Held` state with an empty deferred queue.
    pub fn new(info: OplockInfo, session: SessionRef, deferred_capacity: usize) -> Self {
        Self {
            info,
            break_state: BreakState::Held,
            break_sent_at: None,
            deferred: Arc::new(DeferredQueue::new(deferred_capacity)),
            session,
        }
    }

    pub fn info(&self) -> &OplockInfo {
        &self.info
    }

    pub fn level(&self) -> OplockLevel {
        self.info.level
    }

    pub fn set_level(&mut self, level: OplockLevel) {
        self.info.level = level;
    }

    pub fn session(&self) -> &SessionRef {
        &self.session
    }

    pub fn deferred(&self) -> &Arc<DeferredQueue> {
        &self.deferred
    }

    pub fn break_state(&self) -> BreakState {
        self.break_state
    }

    pub fn is_breaking(&self) -> bool {
        self.break_state == BreakState::InProgress
    }

    /// Tells whether a previous break timed out, which suppresses any
    /// further break cycle.
    pub fn break_failed(&self) -> bool {
        self.break_state == BreakState::Failed
    }

    /// Instant the break request was reported written to the owner.
    pub fn break_sent_at(&self) -> Option<Instant> {
        self.break_sent_at
    }

    /// `Held -> InProgress`. Returns false when a break is already
    /// underway or has already resolved, so exactly one transition happens
    /// per break cycle.
    pub fn start_break(&mut self) -> bool {
        if self.break_state != BreakState::Held {
            return false;
        }
        self.break_state = BreakState::InProgress;
        true
    }

    /// Records the moment the dispatcher reported the break packet
    /// written; the break timeout is measured from here.
    pub fn mark_break_sent(&mut self, at: Instant) {
        self.break_sent_at = Some(at);
    }

    /// `InProgress -> Broken`. Returns false outside a break cycle.
    pub fn acknowledge(&mut self) -> bool {
        if self.break_state != BreakState::InProgress {
            return false;
        }
        self.break_state = BreakState::Broken;
        true
    }

    /// `InProgress -> Failed`. Returns false outside a break cycle.
    pub fn fail(&mut self) -> bool {
        if self.break_state != BreakState::InProgress {
            return false;
        }
        self.break_state = BreakState::Failed;
        true
    }

    /// Re-arms the record at a lower level after an acknowledgement (or a
    /// voluntary downgrade): back to `Held`, break bookkeeping cleared.
    /// Callers resolving a break call [`LocalOplock::acknowledge`] first,
    /// so the cycle passes through `Broken`.
    pub fn lower_to(&mut self, level: OplockLevel) {
        self.info.level = level;
        self.info.break_in_progress = false;
        self.info.break_failed = false;
        self.break_state = BreakState::Held;
        self.break_sent_at = None;
    }
}

impl std::fmt::Debug for LocalOplock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalOplock")
            .field("level", &self.info.level)
            .field("owner", &self.info.owner)
            .field("break_state", &self.break_state)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}
