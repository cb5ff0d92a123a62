//! Defines the seams toward the distributed key/value and messaging
//! runtime hosting the clustered cache.
//!
//! The runtime supplies partitioned storage with per-key locks, remote
//! task routing, a topic, and membership events; the cache never assumes
//! more than these traits promise. An in-process implementation for tests
//! and demos lives in `demos/loopback/`.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cluster::message::ClusterMessage;
use crate::cluster::task::{StateTask, TaskReply};
use crate::error::Result;
use crate::path::PathKey;
use crate::session::NodeId;
use crate::state::FileState;

/// Partitioned, replicated map of file states with per-key locks.
///
/// Every key has exactly one partition owner; the map is observable from
/// any node. `lock_key`/`unlock_key` provide the distributed per-state
/// exclusive lock of the concurrency model.
#[async_trait]
pub trait DistributedMap: Send + Sync {
    /// Takes the cluster-wide exclusive lock on the key.
    async fn lock_key(&self, key: &PathKey);

    /// Releases the cluster-wide lock on the key.
    async fn unlock_key(&self, key: &PathKey);

    /// Reads the state. Does not require the key lock.
    async fn get(&self, key: &PathKey) -> Option<FileState>;

    /// Writes the state back. Callers hold the key lock.
    async fn put(&self, key: &PathKey, state: FileState);

    /// Drops the state. Callers hold the key lock.
    async fn remove(&self, key: &PathKey) -> Option<FileState>;

    /// Keys whose partition this node owns.
    async fn owned_keys(&self) -> Vec<PathKey>;

    /// Tells whether this node is the partition owner of the key.
    fn owns(&self, key: &PathKey) -> bool;
}

/// Publish side of the well-known state topic. Subscription is part of
/// [`ClusterRuntime`], which fans messages into per-cache channels.
#[async_trait]
pub trait StateTopic: Send + Sync {
    async fn publish(&self, message: ClusterMessage) -> Result<()>;
}

/// Cluster membership change, as reported by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    MemberJoined(NodeId),
    MemberLeft(NodeId),
}

/// One node's view of the cluster runtime.
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    /// Identity of this node.
    fn node_id(&self) -> &NodeId;

    /// The partitioned state map.
    fn map(&self) -> &dyn DistributedMap;

    /// The state topic's publish side.
    fn topic(&self) -> &dyn StateTopic;

    /// Routes a task to the key's partition owner, executes it there
    /// under the key lock, and returns its structured reply. Transport
    /// or owner failures surface as [`crate::error::Error::RemoteTaskFailure`];
    /// the caller maps them onto the operation's own error kind.
    async fn submit(&self, task: StateTask) -> Result<TaskReply>;

    /// Registers a subscription delivering every topic message published
    /// anywhere in the cluster, including this node's own.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterMessage>;

    /// Registers a subscription for membership events.
    fn membership(&self) -> mpsc::UnboundedReceiver<MembershipEvent>;
}
