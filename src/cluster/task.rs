//! Defines the serializable remote tasks executed on a key's partition
//! owner.
//!
//! A task is plain data: `{key, op}`. The owner locks the key in the
//! distributed map, reads the state, applies the mutation, writes it
//! back, unlocks, and returns a structured reply. Tasks never close over
//! node-local resources.

use serde::{Deserialize, Serialize};

use crate::access::{self, AccessToken, BreakRequired, Decision, OpenParams};
use crate::cluster::runtime::DistributedMap;
use crate::error::{Error, Result};
use crate::path::PathKey;
use crate::session::NodeId;
use crate::state::attr::AttrValue;
use crate::state::lock::{ByteRangeLock, LockOwner};
use crate::state::oplock::{OplockInfo, OplockLevel};
use crate::state::{FileState, FileStatus};

/// Mutation to apply to one state, executed under its distributed lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskOp {
    /// Create the state when absent; otherwise read it.
    EnsureState { status: FileStatus },
    GrantAccess { params: OpenParams, probe: FileStatus },
    ReleaseAccess { token: AccessToken },
    AddLock { lock: ByteRangeLock },
    RemoveLock { owner: LockOwner, offset: u64, length: u64 },
    /// Start a break on behalf of a non-open operation (data op) issued
    /// by the given session.
    BeginBreak { requester_node: NodeId, requester_session: crate::session::SessionId },
    AddOplock { info: OplockInfo },
    RemoveOplock,
    ChangeOplockType { level: OplockLevel },
    /// The owning node's break timed out; latch the failure so further
    /// opens proceed as if the oplock were absent.
    MarkBreakFailed,
    UpdateFileStatus { status: FileStatus, file_id: Option<u64> },
    Rename { new_path: PathKey, is_dir: bool },
    SetDataUpdate { node: Option<NodeId> },
    SetAttribute { name: String, value: AttrValue },
    RemoveState,
}

/// One remote task: the key addressing the partition, and the mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTask {
    pub key: PathKey,
    pub op: TaskOp,
}

impl StateTask {
    pub fn new(key: PathKey, op: TaskOp) -> Self {
        Self { key, op }
    }

    /// Serializes the task for the runtime's task transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| Error::RemoteTaskFailure(err.to_string()))
    }

    /// Deserializes a task received by the partition owner.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| Error::RemoteTaskFailure(err.to_string()))
    }
}

/// Structured result of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReply {
    /// Post-mutation snapshot, used to refresh the caller's near cache
    /// and to assemble state-update broadcasts. Absent when the state was
    /// removed or never existed.
    pub state: Option<FileState>,
    pub output: TaskOutput,
}

/// Operation-specific portion of a task reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskOutput {
    Access(Decision),
    Released { remaining: u32, break_resolved: bool },
    LockAdded,
    /// The operation must suspend until the standing oplock's break
    /// resolves.
    Deferred(BreakRequired),
    OplockAttached(bool),
    OplockCleared { break_resolved: bool },
    Unit,
}

/// Task failure in wire form, so a runtime can carry typed errors between
/// nodes. Lossless for every kind a task can produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskError {
    SharingViolation,
    AccessDenied,
    FileExists,
    FileNotFound,
    LockConflict,
    NotLocked,
    DeferFailed,
    ExistingOpLock,
    Other(String),
}

impl From<&Error> for TaskError {
    fn from(error: &Error) -> Self {
        match error {
            Error::SharingViolation => TaskError::SharingViolation,
            Error::AccessDenied => TaskError::AccessDenied,
            Error::FileExists => TaskError::FileExists,
            Error::FileNotFound => TaskError::FileNotFound,
            Error::LockConflict => TaskError::LockConflict,
            Error::NotLocked => TaskError::NotLocked,
            Error::DeferFailed => TaskError::DeferFailed,
            Error::ExistingOpLock => TaskError::ExistingOpLock,
            other => TaskError::Other(other.to_string()),
        }
    }
}

impl From<TaskError> for Error {
    fn from(error: TaskError) -> Self {
        match error {
            TaskError::SharingViolation => Error::SharingViolation,
            TaskError::AccessDenied => Error::AccessDenied,
            TaskError::FileExists => Error::FileExists,
            TaskError::FileNotFound => Error::FileNotFound,
            TaskError::LockConflict => Error::LockConflict,
            TaskError::NotLocked => Error::NotLocked,
            TaskError::DeferFailed => Error::DeferFailed,
            TaskError::ExistingOpLock => Error::ExistingOpLock,
            TaskError::Other(message) => Error::RemoteTaskFailure(message),
        }
    }
}

/// Executes one task on the partition owner.
///
/// Locks the key, applies the mutation, writes the state back, unlocks,
/// and returns the reply. `ttl_millis` is the owner's state lifetime for
/// creations.
///
/// A rename mutates two keys, so it takes both key locks, lowest key
/// first; a task on either key serializes against the move instead of
/// interleaving with its remove/put pair.
pub async fn run_state_task(
    map: &dyn DistributedMap,
    task: StateTask,
    ttl_millis: u64,
) -> Result<TaskReply> {
    if let TaskOp::Rename { new_path, .. } = &task.op {
        let mut keys = [task.key.clone(), new_path.clone()];
        keys.sort();
        let [first, second] = keys;

        map.lock_key(&first).await;
        if second != first {
            map.lock_key(&second).await;
        }
        let result = apply(map, &task, ttl_millis).await;
        if second != first {
            map.unlock_key(&second).await;
        }
        map.unlock_key(&first).await;
        return result;
    }

    map.lock_key(&task.key).await;
    let result = apply(map, &task, ttl_millis).await;
    map.unlock_key(&task.key).await;
    result
}

fn reply(state: FileState, output: TaskOutput) -> TaskReply {
    TaskReply { state: Some(state), output }
}

fn empty_reply(output: TaskOutput) -> TaskReply {
    TaskReply { state: None, output }
}

async fn apply(map: &dyn DistributedMap, task: &StateTask, ttl_millis: u64) -> Result<TaskReply> {
    let key = &task.key;
    match &task.op {
        TaskOp::EnsureState { status } => {
            let state = match map.get(key).await {
                Some(state) => state,
                None => {
                    let state = FileState::new(key.clone(), *status, ttl_millis);
                    map.put(key, state.clone()).await;
                    state
                }
            };
            Ok(reply(state, TaskOutput::Unit))
        }

        TaskOp::GrantAccess { params, probe } => {
            let mut state = match map.get(key).await {
                Some(state) => state,
                None => FileState::new(key.clone(), FileStatus::Unknown, ttl_millis),
            };
            match access::decide_open(&mut state, params, *probe) {
                Ok(decision) => {
                    map.put(key, state.clone()).await;
                    Ok(reply(state, TaskOutput::Access(decision)))
                }
                Err(error) => {
                    // Keep the reconciled status even when the open fails.
                    map.put(key, state).await;
                    Err(error)
                }
            }
        }

        TaskOp::ReleaseAccess { token } => {
            let Some(mut state) = map.get(key).await else {
                return Ok(empty_reply(TaskOutput::Released {
                    remaining: 0,
                    break_resolved: false,
                }));
            };
            let was_breaking = state
                .oplock()
                .map(|info| info.break_in_progress)
                .unwrap_or(false);
            let mut token = token.clone();
            let remaining = access::release_open(&mut state, &mut token);
            let break_resolved = was_breaking && state.oplock().is_none();
            if remaining == 0 {
                state.touch(ttl_millis);
            }
            map.put(key, state.clone()).await;
            Ok(reply(state, TaskOutput::Released { remaining, break_resolved }))
        }

        TaskOp::AddLock { lock } => {
            let Some(mut state) = map.get(key).await else {
                return Err(Error::AccessDenied);
            };
            let needs_break = state.oplock().is_some_and(|info| {
                info.is_effective() && !info.owned_by(&lock.owner.node, lock.owner.session)
            });
            if needs_break {
                let initiated = !state
                    .oplock()
                    .map(|info| info.break_in_progress)
                    .unwrap_or(false);
                if initiated {
                    if let Some(info) = state.oplock_mut() {
                        info.break_in_progress = true;
                    }
                }
                let descriptor = state.oplock().cloned().expect("oplock checked above");
                map.put(key, state.clone()).await;
                return Ok(reply(
                    state,
                    TaskOutput::Deferred(BreakRequired { oplock: descriptor, initiated }),
                ));
            }
            state.locks_mut().add(lock.clone())?;
            map.put(key, state.clone()).await;
            Ok(reply(state, TaskOutput::LockAdded))
        }

        TaskOp::BeginBreak { requester_node, requester_session } => {
            let Some(mut state) = map.get(key).await else {
                return Ok(empty_reply(TaskOutput::Unit));
            };
            let blocking = state.oplock().is_some_and(|info| {
                info.is_effective() && !info.owned_by(requester_node, *requester_session)
            });
            if !blocking {
                return Ok(reply(state, TaskOutput::Unit));
            }
            let initiated = !state
                .oplock()
                .map(|info| info.break_in_progress)
                .unwrap_or(false);
            if initiated {
                if let Some(info) = state.oplock_mut() {
                    info.break_in_progress = true;
                }
            }
            let descriptor = state.oplock().cloned().expect("oplock checked above");
            map.put(key, state.clone()).await;
            Ok(reply(
                state,
                TaskOutput::Deferred(BreakRequired { oplock: descriptor, initiated }),
            ))
        }

        TaskOp::RemoveLock { owner, offset, length } => {
            let Some(mut state) = map.get(key).await else {
                return Err(Error::NotLocked);
            };
            state.locks_mut().remove(owner, *offset, *length)?;
            map.put(key, state.clone()).await;
            Ok(reply(state, TaskOutput::Unit))
        }

        TaskOp::AddOplock { info } => {
            let Some(mut state) = map.get(key).await else {
                return Ok(empty_reply(TaskOutput::OplockAttached(false)));
            };
            if state.open_count() == 0 {
                return Ok(reply(state, TaskOutput::OplockAttached(false)));
            }
            state.set_oplock(info.clone())?;
            map.put(key, state.clone()).await;
            Ok(reply(state, TaskOutput::OplockAttached(true)))
        }

        TaskOp::RemoveOplock => {
            let Some(mut state) = map.get(key).await else {
                return Ok(empty_reply(TaskOutput::OplockCleared { break_resolved: false }));
            };
            let was_breaking = state
                .oplock()
                .map(|info| info.break_in_progress)
                .unwrap_or(false);
            state.clear_oplock();
            map.put(key, state.clone()).await;
            Ok(reply(state, TaskOutput::OplockCleared { break_resolved: was_breaking }))
        }

        TaskOp::ChangeOplockType { level } => {
            let Some(mut state) = map.get(key).await else {
                return Ok(empty_reply(TaskOutput::OplockCleared { break_resolved: false }));
            };
            let was_breaking = state
                .oplock()
                .map(|info| info.break_in_progress)
                .unwrap_or(false);
            state.change_oplock_level(*level);
            if let Some(info) = state.oplock_mut() {
                info.break_in_progress = false;
                info.break_failed = false;
            }
            map.put(key, state.clone()).await;
            Ok(reply(state, TaskOutput::OplockCleared { break_resolved: was_breaking }))
        }

        TaskOp::MarkBreakFailed => {
            let Some(mut state) = map.get(key).await else {
                return Ok(empty_reply(TaskOutput::Unit));
            };
            if let Some(info) = state.oplock_mut() {
                info.break_in_progress = false;
                info.break_failed = true;
            }
            map.put(key, state.clone()).await;
            Ok(reply(state, TaskOutput::Unit))
        }

        TaskOp::UpdateFileStatus { status, file_id } => {
            let mut state = match map.get(key).await {
                Some(state) => state,
                None => FileState::new(key.clone(), *status, ttl_millis),
            };
            state.set_status(*status);
            if let Some(file_id) = file_id {
                if *status != FileStatus::NotExist {
                    state.set_file_id(*file_id);
                }
            }
            map.put(key, state.clone()).await;
            Ok(reply(state, TaskOutput::Unit))
        }

        TaskOp::Rename { new_path, is_dir: _ } => {
            let Some(mut state) = map.remove(key).await else {
                return Err(Error::FileNotFound);
            };
            state.repoint(new_path.clone());
            map.put(new_path, state.clone()).await;
            Ok(reply(state, TaskOutput::Unit))
        }

        TaskOp::SetDataUpdate { node } => {
            let Some(mut state) = map.get(key).await else {
                return Ok(empty_reply(TaskOutput::Unit));
            };
            state.set_data_update_node(node.clone());
            map.put(key, state.clone()).await;
            Ok(reply(state, TaskOutput::Unit))
        }

        TaskOp::SetAttribute { name, value } => {
            let Some(mut state) = map.get(key).await else {
                return Ok(empty_reply(TaskOutput::Unit));
            };
            state.attrs_mut().set(name.clone(), value.clone());
            map.put(key, state.clone()).await;
            Ok(reply(state, TaskOutput::Unit))
        }

        TaskOp::RemoveState => {
            let removed = map.remove(key).await;
            Ok(TaskReply { state: removed, output: TaskOutput::Unit })
        }
    }
}
