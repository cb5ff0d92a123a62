//! Defines the topic messages carrying state coherence hints between
//! cluster nodes.
//!
//! Messages are invalidation hints, never a source of truth: every
//! mutating operation still runs as a task on the partition owner.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::PathKey;
use crate::session::NodeId;
use crate::state::oplock::{OplockInfo, OplockLevel};
use crate::state::{FileStatus, SharingMode};

/// Addressee of a topic message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeTarget {
    AllNodes,
    Node(NodeId),
}

/// Fields of a state broadcast after a mutation on the partition owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdateFields {
    pub status: FileStatus,
    pub file_id: Option<u64>,
    pub open_count: u32,
    pub sharing: SharingMode,
    pub oplock: Option<OplockInfo>,
}

/// Message payloads of the well-known state topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessagePayload {
    /// Ask the node serving the oplock owner to run its break protocol.
    OplockBreakRequest { path: PathKey, new_level: OplockLevel },
    /// A break resolved (acknowledged or timed out): cancel break timers
    /// and requeue node-local deferred requests for the path.
    OplockBreakNotify { path: PathKey },
    /// The oplock level changed without a break cycle.
    OplockTypeChange { path: PathKey, level: OplockLevel },
    /// Post-mutation snapshot hint for near caches.
    StateUpdate { path: PathKey, fields: StateUpdateFields },
    /// A path (and, for directories, its subtree) moved.
    StateRename { old_path: PathKey, new_path: PathKey, is_dir: bool },
    /// A node started rewriting the file's data.
    DataUpdateBegin { path: PathKey, node: NodeId },
    /// The data rewrite finished.
    DataUpdateEnd { path: PathKey, node: NodeId },
}

impl MessagePayload {
    /// Path the payload concerns.
    pub fn path(&self) -> &PathKey {
        match self {
            MessagePayload::OplockBreakRequest { path, .. }
            | MessagePayload::OplockBreakNotify { path }
            | MessagePayload::OplockTypeChange { path, .. }
            | MessagePayload::StateUpdate { path, .. }
            | MessagePayload::DataUpdateBegin { path, .. }
            | MessagePayload::DataUpdateEnd { path, .. } => path,
            MessagePayload::StateRename { old_path, .. } => old_path,
        }
    }
}

/// One message on the state topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMessage {
    pub from: NodeId,
    pub target: NodeTarget,
    pub payload: MessagePayload,
}

impl ClusterMessage {
    pub fn new(from: NodeId, target: NodeTarget, payload: MessagePayload) -> Self {
        Self { from, target, payload }
    }

    /// Tells whether `node` should process the message.
    pub fn addressed_to(&self, node: &NodeId) -> bool {
        match &self.target {
            NodeTarget::AllNodes => true,
            NodeTarget::Node(target) => target == node,
        }
    }

    /// Tells whether `node` published the message itself.
    pub fn is_from(&self, node: &NodeId) -> bool {
        self.from == *node
    }

    /// Serializes the message for the topic wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| Error::RemoteTaskFailure(err.to_string()))
    }

    /// Deserializes a message received from the topic.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| Error::RemoteTaskFailure(err.to_string()))
    }
}
