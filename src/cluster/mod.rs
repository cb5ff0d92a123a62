//! Clustered variant of the file-state cache.
//!
//! Every state is physically owned by exactly one node (the partition
//! owner) but observable from any node. Mutations route to the owner as
//! serializable tasks; coherence rides on a pub/sub topic and per-node
//! near caches. The distributed KV/messaging runtime itself is a
//! collaborator behind the [`runtime`] traits.

pub mod cache;
pub mod message;
pub mod near;
pub mod node;
pub mod runtime;
pub mod task;

#[cfg(test)]
mod tests;

pub use cache::ClusterStateCache;
pub use message::{ClusterMessage, MessagePayload, NodeTarget, StateUpdateFields};
pub use near::NearCache;
pub use node::{PerNodeMap, PerNodeSlot, PerNodeState};
pub use runtime::{ClusterRuntime, DistributedMap, MembershipEvent, StateTopic};
pub use task::{run_state_task, StateTask, TaskError, TaskOp, TaskOutput, TaskReply};
