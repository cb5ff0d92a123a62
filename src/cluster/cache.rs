//! Defines the clustered file-state cache --- [`ClusterStateCache`].
//!
//! Same contract as the standalone cache, with every state owned by
//! exactly one partition owner. Mutations run as remote tasks on the
//! owner; coherence rides on pub/sub invalidations and the per-node near
//! cache. Break machinery stays on the node serving the owning session;
//! every node queues and resumes its own deferred requests.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::access::{AccessToken, Decision, OpenParams, Outcome};
use crate::breaker::{BreakTimeoutHandler, BreakTransport, OplockBreaker, WorkerSender};
use crate::clock;
use crate::cluster::message::{ClusterMessage, MessagePayload, NodeTarget, StateUpdateFields};
use crate::cluster::near::NearCache;
use crate::cluster::node::PerNodeMap;
use crate::cluster::runtime::{ClusterRuntime, MembershipEvent};
use crate::cluster::task::{StateTask, TaskOp, TaskOutput, TaskReply};
use crate::config::{ClusterConfig, DebugFlags};
use crate::defer::DeferredRequest;
use crate::error::{Error, Result};
use crate::path::PathKey;
use crate::session::{NodeId, SessionId, SessionRef};
use crate::state::lock::{ByteRangeLock, LockOwner};
use crate::state::oplock::{LocalOplock, OplockInfo, OplockLevel, OplockOwner};
use crate::state::{FileState, FileStatus};

/// Clustered path-keyed cache of file states.
pub struct ClusterStateCache {
    config: ClusterConfig,
    runtime: Arc<dyn ClusterRuntime>,
    near: NearCache,
    per_node: PerNodeMap,
    breaker: Arc<OplockBreaker>,
}

impl ClusterStateCache {
    /// Creates a node's view of the clustered cache. The configuration is
    /// validated (cluster names required, near-cache timeout clamped).
    pub fn new(
        config: ClusterConfig,
        runtime: Arc<dyn ClusterRuntime>,
        transport: Arc<dyn BreakTransport>,
        workers: WorkerSender,
    ) -> Result<Arc<Self>> {
        let config = config.validate()?;
        let breaker = OplockBreaker::new(config.cache.clone(), transport, workers);
        let near = NearCache::new(config.near_cache_timeout);
        Ok(Arc::new(Self {
            config,
            runtime,
            near,
            per_node: PerNodeMap::new(),
            breaker,
        }))
    }

    /// Spawns the message pump, the membership watcher and the partition
    /// reaper. The handles are returned for shutdown.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Self::run_messages(Arc::clone(self), self.runtime.subscribe())),
            tokio::spawn(Self::run_membership(Arc::clone(self), self.runtime.membership())),
            tokio::spawn(Self::run_reaper(Arc::downgrade(self))),
        ]
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn node_id(&self) -> &NodeId {
        self.runtime.node_id()
    }

    /// Normalizes a raw path under the cache's case policy.
    pub fn key(&self, raw: &str) -> Result<PathKey> {
        PathKey::normalize(raw, self.config.cache.case_sensitive)
    }

    fn debug_enabled(&self, flag: DebugFlags) -> bool {
        self.config.cache.debug_enabled(flag)
    }

    /// Routes a task to the partition owner and refreshes the near cache
    /// from its reply. Task failures poison the near-cache entry.
    async fn submit(&self, key: &PathKey, op: TaskOp) -> Result<TaskReply> {
        let started = Instant::now();
        let task = StateTask::new(key.clone(), op);
        if self.debug_enabled(DebugFlags::REMOTE_TASK) {
            debug!(target: "smb_mamont::cluster", %key, op = ?task.op, "submitting task");
        }
        match self.runtime.submit(task).await {
            Ok(reply) => {
                match &reply.state {
                    Some(state) => self.near.update_local(key, state.clone()),
                    None => self.near.invalidate(key),
                }
                if self.debug_enabled(DebugFlags::REMOTE_TIMING) {
                    debug!(
                        target: "smb_mamont::cluster",
                        %key,
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "task finished"
                    );
                }
                Ok(reply)
            }
            Err(error) => {
                self.near.mark_invalid(key);
                Err(error)
            }
        }
    }

    async fn publish(&self, target: NodeTarget, payload: MessagePayload) {
        let message = ClusterMessage::new(self.node_id().clone(), target, payload);
        if self.debug_enabled(DebugFlags::CLUSTER_MESSAGE) {
            debug!(target: "smb_mamont::cluster", payload = ?message.payload, "publishing");
        }
        if let Err(error) = self.runtime.topic().publish(message).await {
            debug!(target: "smb_mamont::cluster", %error, "publish failed");
        }
    }

    /// Broadcasts a post-mutation snapshot hint, honoring the not-exist
    /// gate.
    async fn broadcast_update(&self, path: &PathKey, state: &FileState) {
        if state.status() == FileStatus::NotExist && !self.config.send_not_exist_states {
            return;
        }
        let fields = StateUpdateFields {
            status: state.status(),
            file_id: state.file_id(),
            open_count: state.open_count(),
            sharing: state.sharing(),
            oplock: state.oplock().cloned(),
        };
        self.publish(
            NodeTarget::AllNodes,
            MessagePayload::StateUpdate { path: path.clone(), fields },
        )
        .await;
    }

    // --- Reads ---------------------------------------------------------

    /// Returns a snapshot: near cache first, then the distributed map.
    pub async fn lookup(&self, path: &PathKey) -> Option<FileState> {
        if let Some(state) = self.near.get(path) {
            if self.debug_enabled(DebugFlags::NEAR_CACHE) {
                debug!(target: "smb_mamont::cluster", %path, "near cache hit");
            }
            return Some(state);
        }
        let state = self.runtime.map().get(path).await?;
        self.near.update_local(path, state.clone());
        Some(state)
    }

    /// Looks a state up, creating it on the partition owner when absent.
    pub async fn lookup_or_create(
        &self,
        path: &PathKey,
        status: FileStatus,
    ) -> Result<FileState> {
        let reply = self.submit(path, TaskOp::EnsureState { status }).await?;
        reply
            .state
            .ok_or_else(|| Error::RemoteTaskFailure("ensure returned no state".to_owned()))
    }

    /// Cluster-wide view of the path's status.
    pub async fn file_exists(&self, path: &PathKey) -> FileStatus {
        match self.lookup(path).await {
            Some(state) => state.status(),
            None => FileStatus::Unknown,
        }
    }

    // --- Open / close --------------------------------------------------

    /// Decides an open on the partition owner. A deferred open suspends
    /// on this node until the break resolves cluster-wide.
    pub async fn grant_access(
        self: &Arc<Self>,
        path: &PathKey,
        params: &OpenParams,
        session: &SessionRef,
        probe: FileStatus,
        suspend: impl FnOnce() -> DeferredRequest,
    ) -> Result<Outcome<AccessToken>> {
        let reply = self
            .submit(path, TaskOp::GrantAccess { params: params.clone(), probe })
            .await?;

        let TaskOutput::Access(decision) = reply.output else {
            return Err(Error::RemoteTaskFailure("unexpected grant reply".to_owned()));
        };

        match decision {
            Decision::Granted(token) => {
                if token.granted_oplock != OplockLevel::None {
                    let info = reply
                        .state
                        .as_ref()
                        .and_then(|state| state.oplock())
                        .cloned()
                        .unwrap_or_else(|| {
                            OplockInfo::new(
                                token.granted_oplock,
                                OplockOwner {
                                    node: params.node.clone(),
                                    session: params.session,
                                    process_id: params.process_id,
                                    tree_id: params.tree_id,
                                    file_id: params.file_id,
                                },
                            )
                        });
                    let slot = self.per_node.ensure(path);
                    slot.lock().oplock = Some(LocalOplock::new(
                        info,
                        session.clone(),
                        self.config.cache.max_deferred,
                    ));
                }
                if let Some(state) = &reply.state {
                    self.broadcast_update(path, state).await;
                }
                Ok(Outcome::Complete(token))
            }
            Decision::Deferred(required) => {
                self.defer_local(path, &required, params.access.wants_write(), suspend)
                    .await?;
                Ok(Outcome::Deferred)
            }
        }
    }

    /// Queues the suspended request on this node and, when this call
    /// initiated the break, asks the owning node to run its break
    /// protocol.
    async fn defer_local(
        self: &Arc<Self>,
        path: &PathKey,
        required: &crate::access::BreakRequired,
        wants_write: bool,
        suspend: impl FnOnce() -> DeferredRequest,
    ) -> Result<()> {
        let queue = {
            let slot = self.per_node.ensure(path);
            let mut entry = slot.lock();
            entry.deferred_queue(self.config.cache.max_deferred)
        };
        if queue.push(suspend()).is_err() {
            return Err(Error::DeferFailed);
        }

        if required.initiated {
            let new_level = if wants_write || required.oplock.level == OplockLevel::Level2 {
                OplockLevel::None
            } else {
                OplockLevel::Level2
            };
            self.publish(
                NodeTarget::Node(required.oplock.owner.node.clone()),
                MessagePayload::OplockBreakRequest { path: path.clone(), new_level },
            )
            .await;
        }

        if !self.breaker.timer_pending(path) {
            let handler: Arc<dyn BreakTimeoutHandler> = Arc::clone(self) as Arc<dyn BreakTimeoutHandler>;
            self.breaker.start_timer(path.clone(), queue, handler);
        }
        Ok(())
    }

    /// Reverses one grant on the partition owner. Idempotent per token.
    pub async fn release_access(&self, token: &mut AccessToken) -> Result<u32> {
        if token.is_released() {
            let remaining = self
                .lookup(&token.path)
                .await
                .map(|state| state.open_count())
                .unwrap_or(0);
            return Ok(remaining);
        }

        let reply = self
            .submit(&token.path, TaskOp::ReleaseAccess { token: token.clone() })
            .await?;
        token.mark_released();

        let TaskOutput::Released { remaining, break_resolved } = reply.output else {
            return Err(Error::RemoteTaskFailure("unexpected release reply".to_owned()));
        };

        // Drop the local break machinery once the shared oplock is gone.
        let oplock_gone = reply
            .state
            .as_ref()
            .map(|state| state.oplock().is_none())
            .unwrap_or(true);
        if oplock_gone {
            if let Some(slot) = self.per_node.get(&token.path) {
                let mut entry = slot.lock();
                let owned = entry.oplock.as_ref().is_some_and(|local| {
                    local.info().owned_by(&token.owner.node, token.owner.session)
                });
                if owned {
                    // The owner's close acknowledges an in-flight break.
                    if let Some(local) = entry.oplock.as_mut() {
                        local.acknowledge();
                    }
                    entry.oplock = None;
                }
            }
        }

        if break_resolved {
            self.publish(
                NodeTarget::AllNodes,
                MessagePayload::OplockBreakNotify { path: token.path.clone() },
            )
            .await;
        }
        if let Some(state) = &reply.state {
            self.broadcast_update(&token.path, state).await;
        }
        Ok(remaining)
    }

    // --- Byte-range locks ----------------------------------------------

    /// Adds a byte-range lock on the partition owner, breaking a standing
    /// oplock held by a different session first.
    pub async fn add_lock(
        self: &Arc<Self>,
        path: &PathKey,
        lock: ByteRangeLock,
        suspend: impl FnOnce() -> DeferredRequest,
    ) -> Result<Outcome<()>> {
        let wants_write = lock.exclusive;
        let reply = self.submit(path, TaskOp::AddLock { lock }).await?;
        match reply.output {
            TaskOutput::LockAdded => {
                if let Some(state) = &reply.state {
                    self.broadcast_update(path, state).await;
                }
                Ok(Outcome::Complete(()))
            }
            TaskOutput::Deferred(required) => {
                self.defer_local(path, &required, wants_write, suspend).await?;
                Ok(Outcome::Deferred)
            }
            _ => Err(Error::RemoteTaskFailure("unexpected lock reply".to_owned())),
        }
    }

    /// Removes the owner's lock with the exact range.
    pub async fn remove_lock(
        &self,
        path: &PathKey,
        owner: &LockOwner,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        self.submit(
            path,
            TaskOp::RemoveLock { owner: owner.clone(), offset, length },
        )
        .await?;
        Ok(())
    }

    /// Tells whether `owner` may read the range, per the last observable
    /// state.
    pub async fn can_read(
        &self,
        path: &PathKey,
        offset: u64,
        length: u64,
        owner: &LockOwner,
    ) -> bool {
        match self.lookup(path).await {
            Some(state) => state.locks().can_read(offset, length, owner),
            None => true,
        }
    }

    /// Tells whether `owner` may write the range, per the last observable
    /// state.
    pub async fn can_write(
        &self,
        path: &PathKey,
        offset: u64,
        length: u64,
        owner: &LockOwner,
    ) -> bool {
        match self.lookup(path).await {
            Some(state) => state.locks().can_write(offset, length, owner),
            None => true,
        }
    }

    // --- Oplocks -------------------------------------------------------

    /// Attaches an oplock to an already-open state, installing the local
    /// break machinery on this node.
    pub async fn add_oplock(
        &self,
        path: &PathKey,
        level: OplockLevel,
        session: &SessionRef,
        owner: OplockOwner,
    ) -> Result<bool> {
        if level == OplockLevel::None {
            return Ok(false);
        }
        let info = OplockInfo::new(level, owner);
        let reply = self.submit(path, TaskOp::AddOplock { info: info.clone() }).await?;
        let TaskOutput::OplockAttached(attached) = reply.output else {
            return Err(Error::RemoteTaskFailure("unexpected oplock reply".to_owned()));
        };
        if attached {
            let slot = self.per_node.ensure(path);
            slot.lock().oplock = Some(LocalOplock::new(
                info,
                session.clone(),
                self.config.cache.max_deferred,
            ));
            if let Some(state) = &reply.state {
                self.broadcast_update(path, state).await;
            }
        }
        Ok(attached)
    }

    /// Detaches the oplock cluster-wide and resumes deferred requests
    /// everywhere.
    pub async fn clear_oplock(&self, path: &PathKey) -> Result<()> {
        let reply = self.submit(path, TaskOp::RemoveOplock).await?;
        if let Some(slot) = self.per_node.get(path) {
            let mut entry = slot.lock();
            if let Some(local) = entry.oplock.as_mut() {
                local.acknowledge();
            }
            entry.oplock = None;
        }
        if let TaskOutput::OplockCleared { break_resolved: true } = reply.output {
            self.publish(
                NodeTarget::AllNodes,
                MessagePayload::OplockBreakNotify { path: path.clone() },
            )
            .await;
        }
        Ok(())
    }

    /// Applies the owning client's level change: a voluntary downgrade or
    /// a break acknowledgement. Called on the node serving the owner.
    pub async fn change_oplock_type(&self, path: &PathKey, new_level: OplockLevel) -> Result<()> {
        let reply = self.submit(path, TaskOp::ChangeOplockType { level: new_level }).await?;

        if let Some(slot) = self.per_node.get(path) {
            let mut entry = slot.lock();
            // `InProgress -> Broken`; the record then clears or re-arms
            // at the lower level.
            if let Some(local) = entry.oplock.as_mut() {
                local.acknowledge();
            }
            if new_level == OplockLevel::None {
                entry.oplock = None;
            } else if let Some(local) = entry.oplock.as_mut() {
                local.lower_to(new_level);
            }
        }

        match reply.output {
            TaskOutput::OplockCleared { break_resolved: true } => {
                self.publish(
                    NodeTarget::AllNodes,
                    MessagePayload::OplockBreakNotify { path: path.clone() },
                )
                .await;
            }
            _ => {
                self.publish(
                    NodeTarget::AllNodes,
                    MessagePayload::OplockTypeChange { path: path.clone(), level: new_level },
                )
                .await;
            }
        }
        Ok(())
    }

    /// Starts a break on behalf of a non-open operation hitting an
    /// oplocked file.
    pub async fn request_oplock_break(
        self: &Arc<Self>,
        path: &PathKey,
        requester_node: &NodeId,
        requester_session: SessionId,
        suspend: impl FnOnce() -> DeferredRequest,
    ) -> Result<Outcome<()>> {
        let reply = self
            .submit(
                path,
                TaskOp::BeginBreak {
                    requester_node: requester_node.clone(),
                    requester_session,
                },
            )
            .await?;
        match reply.output {
            TaskOutput::Unit => Ok(Outcome::Complete(())),
            TaskOutput::Deferred(required) => {
                self.defer_local(path, &required, true, suspend).await?;
                Ok(Outcome::Deferred)
            }
            _ => Err(Error::RemoteTaskFailure("unexpected break reply".to_owned())),
        }
    }

    // --- Status, attributes, data updates ------------------------------

    /// Records a status (and optionally identity) update cluster-wide.
    pub async fn update_file_status(
        &self,
        path: &PathKey,
        status: FileStatus,
        file_id: Option<u64>,
    ) -> Result<()> {
        let reply = self
            .submit(path, TaskOp::UpdateFileStatus { status, file_id })
            .await?;
        if let Some(state) = &reply.state {
            self.broadcast_update(path, state).await;
        }
        Ok(())
    }

    /// Stores a serializable per-path attribute on the partition owner.
    pub async fn set_attribute(
        &self,
        path: &PathKey,
        name: &str,
        value: crate::state::AttrValue,
    ) -> Result<()> {
        self.submit(
            path,
            TaskOp::SetAttribute { name: name.to_owned(), value },
        )
        .await?;
        Ok(())
    }

    /// Marks this node as rewriting the file's data.
    pub async fn set_data_update_in_progress(&self, path: &PathKey) -> Result<()> {
        let node = self.node_id().clone();
        self.submit(path, TaskOp::SetDataUpdate { node: Some(node.clone()) }).await?;
        self.publish(
            NodeTarget::AllNodes,
            MessagePayload::DataUpdateBegin { path: path.clone(), node },
        )
        .await;
        Ok(())
    }

    /// Clears this node's data-update marker.
    pub async fn set_data_update_completed(&self, path: &PathKey) -> Result<()> {
        let node = self.node_id().clone();
        self.submit(path, TaskOp::SetDataUpdate { node: None }).await?;
        self.publish(
            NodeTarget::AllNodes,
            MessagePayload::DataUpdateEnd { path: path.clone(), node },
        )
        .await;
        Ok(())
    }

    // --- Rename and removal --------------------------------------------

    /// Renames the state cluster-wide. The directory's own record moves
    /// on its partition owner; every node then rewrites its own share of
    /// the descendant keys when the rename message arrives.
    pub async fn rename(&self, old_path: &PathKey, new_path: &PathKey, is_dir: bool) -> Result<()> {
        self.submit(
            old_path,
            TaskOp::Rename { new_path: new_path.clone(), is_dir },
        )
        .await?;
        self.publish(
            NodeTarget::AllNodes,
            MessagePayload::StateRename {
                old_path: old_path.clone(),
                new_path: new_path.clone(),
                is_dir,
            },
        )
        .await;
        Ok(())
    }

    /// Removes the state from the cluster.
    pub async fn remove(&self, path: &PathKey) -> Result<Option<FileState>> {
        let reply = self.submit(path, TaskOp::RemoveState).await?;
        self.near.invalidate(path);
        if let Some(slot) = self.per_node.remove(path) {
            let queue = slot.lock().deferred.clone();
            if let Some(queue) = queue {
                self.breaker.cancel_timer(path);
                self.breaker.fail_deferred(&queue).await;
            }
        }
        Ok(reply.state)
    }

    /// Reaps expired states in the partitions this node owns. Returns the
    /// count removed.
    pub async fn remove_expired(&self) -> usize {
        let now = clock::now_millis();
        let map = self.runtime.map();
        let mut reaped = 0;
        for key in map.owned_keys().await {
            map.lock_key(&key).await;
            if let Some(state) = map.get(&key).await {
                if state.is_expired(now) {
                    map.remove(&key).await;
                    self.near.invalidate(&key);
                    reaped += 1;
                }
            }
            map.unlock_key(&key).await;
        }
        if reaped > 0 && self.debug_enabled(DebugFlags::EXPIRE) {
            debug!(target: "smb_mamont::cluster", reaped, "expired states reaped");
        }
        reaped
    }

    // --- Message handling ----------------------------------------------

    async fn run_messages(
        self: Arc<Self>,
        mut messages: mpsc::UnboundedReceiver<ClusterMessage>,
    ) {
        while let Some(message) = messages.recv().await {
            if !message.addressed_to(self.node_id()) {
                continue;
            }
            if self.debug_enabled(DebugFlags::CLUSTER_MESSAGE) {
                debug!(
                    target: "smb_mamont::cluster",
                    from = %message.from,
                    payload = ?message.payload,
                    "message received"
                );
            }
            self.handle_message(message).await;
        }
    }

    async fn handle_message(self: &Arc<Self>, message: ClusterMessage) {
        let from_self = message.is_from(self.node_id());
        match message.payload {
            MessagePayload::OplockBreakRequest { path, new_level } => {
                self.handle_break_request(&path, new_level).await;
            }
            MessagePayload::OplockBreakNotify { path } => {
                self.handle_break_notify(&path).await;
            }
            MessagePayload::OplockTypeChange { path, .. } => {
                if !from_self {
                    self.near.invalidate(&path);
                }
            }
            MessagePayload::StateUpdate { path, .. } => {
                // Hint, not truth: refresh on next read.
                if !from_self {
                    self.near.invalidate(&path);
                }
            }
            MessagePayload::StateRename { old_path, new_path, is_dir } => {
                self.handle_rename(&old_path, &new_path, is_dir).await;
            }
            MessagePayload::DataUpdateBegin { path, .. }
            | MessagePayload::DataUpdateEnd { path, .. } => {
                if !from_self {
                    self.near.invalidate(&path);
                }
            }
        }
    }

    /// Runs the local break protocol for an oplock owned by a session on
    /// this node.
    async fn handle_break_request(self: &Arc<Self>, path: &PathKey, new_level: OplockLevel) {
        let Some(slot) = self.per_node.get(path) else {
            // No machinery here: the owner vanished. Clear the orphaned
            // descriptor for the whole cluster.
            self.clear_orphaned_oplock(path).await;
            return;
        };

        let dispatch = {
            let mut entry = slot.lock();
            let owner_vanished = entry
                .oplock
                .as_ref()
                .is_some_and(|local| !local.session().is_alive());
            if owner_vanished {
                entry.oplock = None;
            }
            match entry.oplock.as_mut() {
                Some(local) => {
                    if !local.start_break() {
                        // Break already underway or resolved.
                        return;
                    }
                    let owner = local.info().owner.clone();
                    Some((local.session().clone(), owner.tree_id, owner.file_id))
                }
                None => None,
            }
        };

        let Some((session, tree_id, file_id)) = dispatch else {
            self.clear_orphaned_oplock(path).await;
            return;
        };

        if self.debug_enabled(DebugFlags::OPLOCK) {
            debug!(target: "smb_mamont::cluster", %path, ?new_level, "breaking local oplock");
        }

        match self.breaker.send_break(&session, tree_id, file_id, new_level).await {
            Ok(()) => {
                {
                    let mut entry = slot.lock();
                    if let Some(local) = entry.oplock.as_mut() {
                        local.mark_break_sent(Instant::now());
                    }
                }
                if !self.breaker.timer_pending(path) {
                    let queue = slot.lock().deferred_queue(self.config.cache.max_deferred);
                    let handler: Arc<dyn BreakTimeoutHandler> = Arc::clone(self) as Arc<dyn BreakTimeoutHandler>;
                    self.breaker.start_timer(path.clone(), queue, handler);
                }
            }
            Err(error) => {
                debug!(target: "smb_mamont::cluster", %path, %error, "break send failed");
                let failed = {
                    let mut entry = slot.lock();
                    entry.oplock.as_mut().map(|local| local.fail()).unwrap_or(false)
                };
                if failed {
                    let _ = self.submit(path, TaskOp::MarkBreakFailed).await;
                    self.publish(
                        NodeTarget::AllNodes,
                        MessagePayload::OplockBreakNotify { path: path.clone() },
                    )
                    .await;
                }
            }
        }
    }

    /// The owning session is gone: remove the descriptor on the partition
    /// owner and release every waiter.
    async fn clear_orphaned_oplock(&self, path: &PathKey) {
        if let Ok(reply) = self.submit(path, TaskOp::RemoveOplock).await {
            if let TaskOutput::OplockCleared { break_resolved: true } = reply.output {
                self.publish(
                    NodeTarget::AllNodes,
                    MessagePayload::OplockBreakNotify { path: path.clone() },
                )
                .await;
            }
        }
    }

    /// A break resolved somewhere in the cluster: cancel this node's
    /// timer and requeue this node's deferred requests.
    async fn handle_break_notify(&self, path: &PathKey) {
        self.near.invalidate(path);
        self.breaker.cancel_timer(path);
        let queue = self
            .per_node
            .get(path)
            .and_then(|slot| slot.lock().deferred.clone());
        if let Some(queue) = queue {
            let stats = self.breaker.requeue_deferred(path, &queue).await;
            if self.debug_enabled(DebugFlags::OPLOCK) {
                debug!(
                    target: "smb_mamont::cluster",
                    %path,
                    attempted = stats.attempted,
                    requeued = stats.requeued,
                    "deferred requests resumed after notify"
                );
            }
        }
    }

    /// Every node rewrites its own share of a renamed directory: the
    /// owned main-map keys, the near-cache keys and the per-node keys.
    async fn handle_rename(&self, old_path: &PathKey, new_path: &PathKey, is_dir: bool) {
        self.near.invalidate(old_path);
        if is_dir {
            let map = self.runtime.map();
            for key in map.owned_keys().await {
                let Some(rebased) = key.rebase(old_path, new_path) else { continue };

                // Each move touches two keys; lock both, lowest first.
                let (first, second) = if key <= rebased {
                    (key.clone(), rebased.clone())
                } else {
                    (rebased.clone(), key.clone())
                };
                map.lock_key(&first).await;
                if second != first {
                    map.lock_key(&second).await;
                }
                if let Some(mut state) = map.remove(&key).await {
                    state.repoint(rebased.clone());
                    map.put(&rebased, state).await;
                }
                if second != first {
                    map.unlock_key(&second).await;
                }
                map.unlock_key(&first).await;
            }
            self.near.rename_descendants(old_path, new_path);
            self.per_node.rename_descendants(old_path, new_path);
        }
        if let Some(slot) = self.per_node.remove(old_path) {
            self.per_node_reinsert(new_path, slot);
        }
        if self.debug_enabled(DebugFlags::RENAME) {
            debug!(target: "smb_mamont::cluster", %old_path, %new_path, is_dir, "rename applied");
        }
    }

    fn per_node_reinsert(&self, path: &PathKey, slot: Arc<crate::cluster::node::PerNodeSlot>) {
        // Move the machinery for the renamed entry itself under its new
        // key, keeping timers and queues attached.
        let target = self.per_node.ensure(path);
        let mut source = slot.lock();
        let mut destination = target.lock();
        destination.oplock = source.oplock.take();
        destination.deferred = source.deferred.take();
        destination.file_id = source.file_id.take();
        destination.attrs = std::mem::take(&mut source.attrs);
    }

    // --- Membership ----------------------------------------------------

    async fn run_membership(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<MembershipEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                MembershipEvent::MemberJoined(node) => {
                    if self.debug_enabled(DebugFlags::MEMBERSHIP) {
                        debug!(target: "smb_mamont::cluster", %node, "member joined");
                    }
                }
                MembershipEvent::MemberLeft(node) => {
                    if self.debug_enabled(DebugFlags::MEMBERSHIP) {
                        debug!(target: "smb_mamont::cluster", %node, "member left");
                    }
                    self.handle_member_left(&node).await;
                }
            }
        }
    }

    /// Strips a departed member's opens, locks and oplocks from every
    /// state this node owns, then releases local waiters blocked on the
    /// departed member's oplocks.
    async fn handle_member_left(&self, departed: &NodeId) {
        let map = self.runtime.map();
        for key in map.owned_keys().await {
            map.lock_key(&key).await;
            let mut resolved_break = false;
            if let Some(mut state) = map.get(&key).await {
                let mut touched = false;
                if state.locks_mut().remove_node_locks(departed) > 0 {
                    touched = true;
                }
                let departed_oplock = state
                    .oplock()
                    .is_some_and(|info| info.owner.node == *departed);
                if departed_oplock {
                    resolved_break = state
                        .oplock()
                        .map(|info| info.break_in_progress)
                        .unwrap_or(false);
                    state.clear_oplock();
                    touched = true;
                }
                let before = state.open_count();
                if state.forget_node_opens(departed) != before {
                    touched = true;
                }
                if touched {
                    state.check_invariants();
                    map.put(&key, state).await;
                }
            }
            map.unlock_key(&key).await;
            self.near.invalidate(&key);

            if resolved_break {
                self.publish(
                    NodeTarget::AllNodes,
                    MessagePayload::OplockBreakNotify { path: key.clone() },
                )
                .await;
            }
        }
    }

    // --- Reaper --------------------------------------------------------

    async fn run_reaper(cache: std::sync::Weak<Self>) {
        let interval = match cache.upgrade() {
            Some(cache) => cache.config.cache.expiry_interval,
            None => return,
        };
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else { return };
            cache.remove_expired().await;
        }
    }
}

impl BreakTimeoutHandler for ClusterStateCache {
    /// Fires on this node's break timer. When this node serves the
    /// owning session, the failure latches into the distributed state and
    /// the cluster is notified; in every case this node's own deferred
    /// requests are failed by the scheduler.
    fn mark_break_failed(&self, path: &PathKey) -> bool {
        let owner_failed = self
            .per_node
            .get(path)
            .map(|slot| {
                let mut entry = slot.lock();
                entry.oplock.as_mut().map(|local| local.fail()).unwrap_or(false)
            })
            .unwrap_or(false);

        if owner_failed {
            let runtime = Arc::clone(&self.runtime);
            let node = self.node_id().clone();
            let key = path.clone();
            tokio::spawn(async move {
                let task = StateTask::new(key.clone(), TaskOp::MarkBreakFailed);
                if let Err(error) = runtime.submit(task).await {
                    debug!(target: "smb_mamont::cluster", %key, %error, "break-failed latch lost");
                }
                let message = ClusterMessage::new(
                    node,
                    NodeTarget::AllNodes,
                    MessagePayload::OplockBreakNotify { path: key },
                );
                let _ = runtime.topic().publish(message).await;
            });
        }
        true
    }
}
