//! In-process cluster runtime backing the cluster demos and tests.
//!
//! One shared grid plays the role of the distributed KV/messaging
//! runtime: a single state store partitioned by key hash, per-key locks,
//! a broadcast topic and scriptable membership. Every node sees the same
//! storage, exactly like members of a replicated map.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};

use smb_mamont::cluster::{
    run_state_task, ClusterMessage, ClusterRuntime, DistributedMap, MembershipEvent, StateTask,
    StateTopic, TaskReply,
};
use smb_mamont::error::{Error, Result};
use smb_mamont::path::PathKey;
use smb_mamont::session::NodeId;
use smb_mamont::state::FileState;

struct GridShared {
    states: DashMap<PathKey, FileState>,
    key_locks: DashMap<PathKey, Arc<Semaphore>>,
    members: RwLock<Vec<NodeId>>,
    message_subs: Mutex<Vec<mpsc::UnboundedSender<ClusterMessage>>>,
    membership_subs: Mutex<Vec<mpsc::UnboundedSender<MembershipEvent>>>,
}

impl GridShared {
    fn key_lock(&self, key: &PathKey) -> Arc<Semaphore> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    fn partition_owner(&self, key: &PathKey) -> Option<NodeId> {
        let members = self.members.read().expect("members poisoned");
        if members.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % members.len();
        Some(members[index].clone())
    }
}

/// The shared in-process cluster.
#[derive(Clone)]
pub struct LoopbackGrid {
    shared: Arc<GridShared>,
}

impl LoopbackGrid {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(GridShared {
                states: DashMap::new(),
                key_locks: DashMap::new(),
                members: RwLock::new(Vec::new()),
                message_subs: Mutex::new(Vec::new()),
                membership_subs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers a member node and returns its runtime handle.
    pub fn join(&self, name: &str, state_ttl_millis: u64) -> Arc<LoopbackNode> {
        let node = NodeId::new(name);
        {
            let mut members = self.shared.members.write().expect("members poisoned");
            members.push(node.clone());
        }
        self.broadcast_membership(MembershipEvent::MemberJoined(node.clone()));
        Arc::new(LoopbackNode {
            node,
            shared: Arc::clone(&self.shared),
            state_ttl_millis,
        })
    }

    /// Removes a member, repartitioning its keys onto the survivors, and
    /// reports the departure to every remaining node.
    pub fn depart(&self, node: &NodeId) {
        {
            let mut members = self.shared.members.write().expect("members poisoned");
            members.retain(|member| member != node);
        }
        self.broadcast_membership(MembershipEvent::MemberLeft(node.clone()));
    }

    fn broadcast_membership(&self, event: MembershipEvent) {
        let mut subs = self.shared.membership_subs.lock().expect("subs poisoned");
        subs.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

/// One member's view of the loopback grid.
pub struct LoopbackNode {
    node: NodeId,
    shared: Arc<GridShared>,
    state_ttl_millis: u64,
}

#[async_trait]
impl DistributedMap for LoopbackNode {
    async fn lock_key(&self, key: &PathKey) {
        let lock = self.shared.key_lock(key);
        lock.acquire().await.expect("grid semaphore closed").forget();
    }

    async fn unlock_key(&self, key: &PathKey) {
        self.shared.key_lock(key).add_permits(1);
    }

    async fn get(&self, key: &PathKey) -> Option<FileState> {
        self.shared.states.get(key).map(|entry| entry.value().clone())
    }

    async fn put(&self, key: &PathKey, state: FileState) {
        self.shared.states.insert(key.clone(), state);
    }

    async fn remove(&self, key: &PathKey) -> Option<FileState> {
        self.shared.states.remove(key).map(|(_, state)| state)
    }

    async fn owned_keys(&self) -> Vec<PathKey> {
        self.shared
            .states
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| self.owns(key))
            .collect()
    }

    fn owns(&self, key: &PathKey) -> bool {
        self.shared.partition_owner(key).as_ref() == Some(&self.node)
    }
}

#[async_trait]
impl StateTopic for LoopbackNode {
    async fn publish(&self, message: ClusterMessage) -> Result<()> {
        // Exercise the wire codec even in-process.
        let encoded = message.encode()?;
        let decoded = ClusterMessage::decode(&encoded)?;
        let mut subs = self.shared.message_subs.lock().expect("subs poisoned");
        subs.retain(|sender| sender.send(decoded.clone()).is_ok());
        Ok(())
    }
}

#[async_trait]
impl ClusterRuntime for LoopbackNode {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    fn map(&self) -> &dyn DistributedMap {
        self
    }

    fn topic(&self) -> &dyn StateTopic {
        self
    }

    async fn submit(&self, task: StateTask) -> Result<TaskReply> {
        // Route to the partition owner; in-process every member shares
        // the storage, so execution happens right here, under the same
        // per-key lock the owner would take.
        let Some(_owner) = self.shared.partition_owner(&task.key) else {
            return Err(Error::RemoteTaskFailure("no cluster members".to_owned()));
        };
        let encoded = task.encode()?;
        let task = StateTask::decode(&encoded)?;
        run_state_task(self, task, self.state_ttl_millis).await
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared.message_subs.lock().expect("subs poisoned").push(sender);
        receiver
    }

    fn membership(&self) -> mpsc::UnboundedReceiver<MembershipEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared
            .membership_subs
            .lock()
            .expect("subs poisoned")
            .push(sender);
        receiver
    }
}
