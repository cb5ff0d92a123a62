//! Defines the access arbiter: the decision procedure that grants, denies
//! or defers an open against a file state.
//!
//! The arbiter is pure bookkeeping over a [`FileState`] and runs under the
//! state's exclusive lock. Side effects that must happen outside the lock
//! (sending a break request, queueing the suspended request) are described
//! by the returned [`Decision`] and performed by the caller.

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::PathKey;
use crate::session::{NodeId, SessionId};
use crate::state::oplock::{OplockInfo, OplockLevel, OplockOwner};
use crate::state::{FileState, FileStatus, OwnerId, RequestedAccess, SharingMode};

/// What to do with an existing or missing file, as requested by the
/// client. Values follow the SMB NTCreate encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
pub enum CreateDisposition {
    /// Replace an existing file; create when absent.
    Supersede = 0,
    /// Open an existing file; fail when absent.
    Open = 1,
    /// Create a new file; fail when present.
    Create = 2,
    /// Open when present, create when absent.
    OpenIf = 3,
    /// Truncate an existing file; fail when absent.
    Overwrite = 4,
    /// Truncate when present, create when absent.
    OverwriteIf = 5,
}

/// How the backing file was (or is to be) opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenAction {
    Opened,
    Created,
    Truncated,
    Superseded,
}

/// Parameters of one open request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenParams {
    pub access: RequestedAccess,
    /// Access kinds this opener tolerates from others.
    pub sharing: SharingMode,
    pub disposition: CreateDisposition,
    pub directory: bool,
    pub node: NodeId,
    pub session: SessionId,
    pub process_id: u32,
    pub tree_id: u32,
    /// Dispatcher file id of the handle being opened; addresses a break
    /// request back to this handle if it is granted an oplock.
    pub file_id: u32,
    pub requested_oplock: OplockLevel,
}

impl OpenParams {
    pub fn owner(&self) -> OwnerId {
        OwnerId { node: self.node.clone(), session: self.session }
    }

    fn oplock_owner(&self) -> OplockOwner {
        OplockOwner {
            node: self.node.clone(),
            session: self.session,
            process_id: self.process_id,
            tree_id: self.tree_id,
            file_id: self.file_id,
        }
    }
}

/// Receipt for one successful grant. Releasing it reverses the grant's
/// bookkeeping; release is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub path: PathKey,
    pub owner: OwnerId,
    pub access: RequestedAccess,
    pub action: OpenAction,
    pub granted_oplock: OplockLevel,
    released: bool,
}

impl AccessToken {
    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn mark_released(&mut self) {
        self.released = true;
    }
}

/// Break side effect the caller must carry out after dropping the state
/// lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakRequired {
    /// Descriptor of the oplock to break, naming the owner to notify.
    pub oplock: OplockInfo,
    /// True when this decision flipped the break-in-progress flag; only
    /// the initiating call sends the break request and starts the timer.
    pub initiated: bool,
}

/// Completion of a cache operation that may suspend behind an oplock
/// break. A deferred operation finishes event-driven: the caller must not
/// retry synchronously.
#[derive(Debug)]
pub enum Outcome<T> {
    Complete(T),
    Deferred,
}

impl<T> Outcome<T> {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Outcome::Deferred)
    }

    /// Unwraps a completed outcome; panics on a deferred one. Test helper
    /// semantics, but convenient for callers that already excluded
    /// deferral.
    pub fn completed(self) -> T {
        match self {
            Outcome::Complete(value) => value,
            Outcome::Deferred => panic!("operation was deferred"),
        }
    }
}

/// Outcome of an arbiter decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Decision {
    /// The open is granted; the state has been mutated accordingly.
    Granted(AccessToken),
    /// The open must suspend until the oplock break resolves. The caller
    /// queues the inbound request and, when `break_required.initiated`,
    /// emits the break request.
    Deferred(BreakRequired),
}

/// Applies the create disposition to the observed status.
///
/// Returns the resulting open action, or the disposition's failure for
/// that status.
fn apply_disposition(disposition: CreateDisposition, status: FileStatus) -> Result<OpenAction> {
    let exists = status.exists();
    match disposition {
        CreateDisposition::Supersede => {
            Ok(if exists { OpenAction::Superseded } else { OpenAction::Created })
        }
        CreateDisposition::Open => {
            if exists {
                Ok(OpenAction::Opened)
            } else {
                Err(Error::FileNotFound)
            }
        }
        CreateDisposition::Create => {
            if exists {
                Err(Error::FileExists)
            } else {
                Ok(OpenAction::Created)
            }
        }
        CreateDisposition::OpenIf => {
            Ok(if exists { OpenAction::Opened } else { OpenAction::Created })
        }
        CreateDisposition::Overwrite => {
            if exists {
                Ok(OpenAction::Truncated)
            } else {
                Err(Error::FileNotFound)
            }
        }
        CreateDisposition::OverwriteIf => {
            Ok(if exists { OpenAction::Truncated } else { OpenAction::Created })
        }
    }
}

/// Tells whether an existing oplock forces the new open to wait.
///
/// Exclusive levels break on any non-attribute open by another client; a
/// shared level breaks only when the newcomer wants to write.
fn oplock_blocks(info: &OplockInfo, params: &OpenParams) -> bool {
    if !info.is_effective() {
        return false;
    }
    if info.owned_by(&params.node, params.session) {
        return false;
    }
    if params.access.is_attributes_only() {
        return false;
    }
    info.level.is_exclusive() || params.access.wants_write()
}

/// Decides one open against the state, under the state's exclusive lock.
///
/// `probe` is the backing-filesystem status supplied by the caller; it is
/// reconciled into the state before the disposition is applied. On a
/// grant the state is fully updated (open recorded, oplock attached when
/// requested and permitted). On a deferral the only state change is the
/// break-in-progress flag of the standing oplock.
pub fn decide_open(state: &mut FileState, params: &OpenParams, probe: FileStatus) -> Result<Decision> {
    if probe != FileStatus::Unknown {
        state.set_status(probe);
    }

    let action = apply_disposition(params.disposition, state.status())?;

    // Metadata-only opens never violate sharing, never consume share bits
    // and never join the open bookkeeping; they coexist with any oplock.
    if params.access.is_attributes_only() {
        return Ok(Decision::Granted(AccessToken {
            path: state.path().clone(),
            owner: params.owner(),
            access: params.access,
            action,
            granted_oplock: OplockLevel::None,
            released: false,
        }));
    }

    if state.open_count() > 0 {
        // Sharing check first: a violation is reported even while a break
        // is pending for some other opener.
        if !state.sharing().allows(params.access.share_bits()) {
            return Err(Error::SharingViolation);
        }

        let blocking = match state.oplock() {
            Some(info) if oplock_blocks(info, params) => Some(info.clone()),
            _ => None,
        };
        if let Some(mut descriptor) = blocking {
            let initiated = !descriptor.break_in_progress;
            if initiated {
                if let Some(info) = state.oplock_mut() {
                    info.break_in_progress = true;
                }
                descriptor.break_in_progress = true;
            }
            return Ok(Decision::Deferred(BreakRequired {
                oplock: descriptor,
                initiated,
            }));
        }
    }

    let granted_oplock = grantable_oplock(state, params);

    state.record_open(params.owner(), params.sharing);
    match action {
        OpenAction::Created => {
            state.set_status(if params.directory {
                FileStatus::DirectoryExists
            } else {
                FileStatus::FileExists
            });
        }
        OpenAction::Superseded | OpenAction::Truncated => {
            state.set_status(FileStatus::FileExists);
        }
        OpenAction::Opened => {}
    }

    if granted_oplock != OplockLevel::None {
        let info = OplockInfo::new(granted_oplock, params.oplock_owner());
        state.set_oplock(info)?;
    }

    Ok(Decision::Granted(AccessToken {
        path: state.path().clone(),
        owner: params.owner(),
        access: params.access,
        action,
        granted_oplock,
        released: false,
    }))
}

/// Oplock level the open may be granted inline, per the state it joins.
fn grantable_oplock(state: &FileState, params: &OpenParams) -> OplockLevel {
    if params.requested_oplock == OplockLevel::None
        || params.directory
        || params.access.is_attributes_only()
        || state.oplock().is_some()
    {
        return OplockLevel::None;
    }
    match params.requested_oplock {
        // Exclusive caching only for the sole opener.
        OplockLevel::Exclusive | OplockLevel::Batch if state.open_count() == 0 => {
            params.requested_oplock
        }
        OplockLevel::Exclusive | OplockLevel::Batch => OplockLevel::None,
        OplockLevel::Level2 => OplockLevel::Level2,
        OplockLevel::None => OplockLevel::None,
    }
}

/// Reverses one grant's bookkeeping. Idempotent per token: a second
/// release of the same token is a no-op returning the current count.
///
/// The owner's last close also acts as a break acknowledgement for any
/// oplock the owner still holds on the state.
pub fn release_open(state: &mut FileState, token: &mut AccessToken) -> u32 {
    if token.is_released() {
        return state.open_count();
    }
    token.mark_released();

    // Metadata-only opens never joined the bookkeeping.
    if token.access.is_attributes_only() {
        return state.open_count();
    }

    let clear = state
        .oplock()
        .is_some_and(|info| info.owned_by(&token.owner.node, token.owner.session));
    if clear {
        state.clear_oplock();
    }

    state.record_close(&token.owner.node)
}

#[cfg(test)]
mod tests;
