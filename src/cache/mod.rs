//! Defines the standalone file-state cache --- [`LocalStateCache`].
//!
//! The cache maps canonical paths to per-path state slots. Every
//! read-modify-write runs under the slot's mutex, held only for the
//! decision itself; break I/O, listener callbacks and worker hand-offs
//! happen after the lock is dropped.

mod reaper;


pub use reaper::ExpiryReaper;

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::access::{self, AccessToken, Decision, OpenParams, Outcome};
use crate::breaker::{BreakTimeoutHandler, BreakTransport, OplockBreaker, WorkerSender};
use crate::clock;
use crate::config::{CacheConfig, DebugFlags};
use crate::defer::{DeferredQueue, DeferredRequest, RequeueStats};
use crate::error::{Error, Result};
use crate::path::PathKey;
use crate::session::{NodeId, SessionId, SessionRef};
use crate::state::lock::{ByteRangeLock, LockOwner};
use crate::state::oplock::{LocalOplock, OplockInfo, OplockLevel, OplockOwner};
use crate::state::{FileState, FileStatus};

/// Lifecycle hooks for the notify-change subsystem.
///
/// Listeners run synchronously on the calling thread, outside the slot
/// lock; they must not re-enter the cache for the same key from the
/// callback.
pub trait StateListener: Send + Sync {
    fn state_created(&self, state: &FileState) {
        let _ = state;
    }
    fn state_expired(&self, state: &FileState) {
        let _ = state;
    }
    fn state_closed(&self, state: &FileState) {
        let _ = state;
    }
}

/// One cache entry: the file state plus the node-local oplock machinery.
pub(crate) struct StateSlot {
    inner: Mutex<SlotInner>,
}

pub(crate) struct SlotInner {
    pub state: FileState,
    /// Break machinery for the oplock in `state`, present exactly when
    /// the oplock's owner is served by this node.
    pub oplock: Option<LocalOplock>,
    /// Set under the slot lock just before the slot leaves the map; a
    /// looker-up observing it retries against the map.
    pub reaped: bool,
}

impl StateSlot {
    fn new(state: FileState) -> Self {
        Self {
            inner: Mutex::new(SlotInner { state, oplock: None, reaped: false }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().expect("state slot poisoned")
    }
}

/// Addressing captured under the slot lock for a break request sent
/// after it is dropped.
struct BreakDispatch {
    session: SessionRef,
    tree_id: u32,
    file_id: u32,
    new_level: OplockLevel,
    queue: Arc<DeferredQueue>,
}

/// Path-keyed cache of file states for a single server node.
pub struct LocalStateCache {
    config: CacheConfig,
    node: NodeId,
    states: DashMap<PathKey, Arc<StateSlot>>,
    /// Creates hold this shared; rename holds it exclusive, so no fresh
    /// state can appear under either key while a record moves between
    /// them.
    rename_gate: RwLock<()>,
    listeners: RwLock<Vec<Arc<dyn StateListener>>>,
    breaker: Arc<OplockBreaker>,
}

impl LocalStateCache {
    /// Creates a cache wired to the dispatcher's break transport and
    /// worker pool.
    pub fn new(
        config: CacheConfig,
        transport: Arc<dyn BreakTransport>,
        workers: WorkerSender,
    ) -> Arc<Self> {
        let breaker = OplockBreaker::new(config.clone(), transport, workers);
        Arc::new(Self {
            config,
            node: NodeId::local(),
            states: DashMap::new(),
            rename_gate: RwLock::new(()),
            listeners: RwLock::new(Vec::new()),
            breaker,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Normalizes a raw path under the cache's case policy.
    pub fn key(&self, raw: &str) -> Result<PathKey> {
        PathKey::normalize(raw, self.config.case_sensitive)
    }

    /// Starts the background expiry reaper.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        ExpiryReaper::spawn(Arc::clone(self))
    }

    /// Registers a lifecycle listener.
    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.listeners.write().expect("listeners poisoned").push(listener);
    }

    fn notify<F: Fn(&dyn StateListener)>(&self, call: F) {
        let listeners = self.listeners.read().expect("listeners poisoned");
        for listener in listeners.iter() {
            call(listener.as_ref());
        }
    }

    /// Milliseconds a state lives after its last close or creation.
    fn state_ttl(&self) -> u64 {
        clock::millis(self.config.expiry_interval).saturating_mul(2)
    }

    /// Clones the slot handle out of the map. Never holds the map shard
    /// while the slot mutex is taken.
    fn slot(&self, path: &PathKey) -> Option<Arc<StateSlot>> {
        let slot = self.states.get(path).map(|entry| Arc::clone(entry.value()))?;
        if slot.lock().reaped {
            return None;
        }
        Some(slot)
    }

    /// Returns the slot for `path`, creating it with `status` when absent.
    /// Creation is atomic: concurrent callers observe one slot.
    fn ensure_slot(&self, path: &PathKey, status: FileStatus) -> Arc<StateSlot> {
        loop {
            let (slot, created) = {
                let _creates = self.rename_gate.read().expect("rename gate poisoned");
                match self.states.entry(path.clone()) {
                    Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
                    Entry::Vacant(entry) => {
                        let state = FileState::new(path.clone(), status, self.state_ttl());
                        let slot = Arc::new(StateSlot::new(state));
                        entry.insert(Arc::clone(&slot));
                        (slot, true)
                    }
                }
            };
            if created {
                if self.config.debug_enabled(DebugFlags::STATE_CACHE) {
                    debug!(target: "smb_mamont::cache", %path, ?status, "state created");
                }
                let snapshot = slot.lock().state.clone();
                self.notify(|listener| listener.state_created(&snapshot));
                return slot;
            }
            // Lost a race against the reaper: the slot left the map after
            // we cloned it. Try again for a fresh one.
            if !slot.lock().reaped {
                return slot;
            }
        }
    }

    /// Looks a state up without creating it. Returns a snapshot.
    pub fn lookup(&self, path: &PathKey) -> Option<FileState> {
        self.slot(path).map(|slot| slot.lock().state.clone())
    }

    /// Looks a state up, creating it with `status` when absent. Returns a
    /// snapshot of the (possibly fresh) state.
    pub fn lookup_or_create(&self, path: &PathKey, status: FileStatus) -> FileState {
        self.ensure_slot(path, status).lock().state.clone()
    }

    /// Cached status of the path, `Unknown` when nothing is cached.
    pub fn file_exists(&self, path: &PathKey) -> FileStatus {
        self.lookup(path).map(|state| state.status()).unwrap_or(FileStatus::Unknown)
    }

    /// Number of cached states.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Decides an open against the path's state.
    ///
    /// `probe` is the backing-filesystem status observed by the caller.
    /// `suspend` materializes the deferred request (moving the inbound
    /// message buffer) and is invoked only when the open must wait for an
    /// oplock break.
    pub async fn grant_access(
        self: &Arc<Self>,
        path: &PathKey,
        params: &OpenParams,
        session: &SessionRef,
        probe: FileStatus,
        suspend: impl FnOnce() -> DeferredRequest,
    ) -> Result<Outcome<AccessToken>> {
        let slot = self.ensure_slot(path, FileStatus::Unknown);

        let dispatch = {
            let mut inner = slot.lock();
            loop {
                match access::decide_open(&mut inner.state, params, probe)? {
                    Decision::Granted(token) => {
                        if token.granted_oplock != OplockLevel::None {
                            let info = inner
                                .state
                                .oplock()
                                .cloned()
                                .expect("granted oplock recorded in state");
                            inner.oplock = Some(LocalOplock::new(
                                info,
                                session.clone(),
                                self.config.max_deferred,
                            ));
                        }
                        if self.config.debug_enabled(DebugFlags::FILE_ACCESS) {
                            debug!(
                                target: "smb_mamont::access",
                                %path,
                                access = ?params.access,
                                opens = inner.state.open_count(),
                                "access granted"
                            );
                        }
                        inner.state.check_invariants();
                        return Ok(Outcome::Complete(token));
                    }
                    Decision::Deferred(required) => {
                        if inner.oplock.is_none() {
                            // The oplock descriptor outlived its local
                            // machinery (owner already gone); drop it and
                            // decide again.
                            inner.state.clear_oplock();
                            continue;
                        }
                        let wants_write = params.access.wants_write();
                        break self.defer_request(
                            &mut inner,
                            required.initiated,
                            wants_write,
                            suspend,
                        )?;
                    }
                }
            }
        };

        self.dispatch_break(path, dispatch).await;
        Ok(Outcome::Deferred)
    }

    /// Queues the suspended request under the slot lock and captures the
    /// break addressing when this call initiates the cycle.
    fn defer_request(
        &self,
        inner: &mut SlotInner,
        initiated: bool,
        wants_write: bool,
        suspend: impl FnOnce() -> DeferredRequest,
    ) -> Result<Option<BreakDispatch>> {
        let local = inner.oplock.as_mut().expect("checked by caller");
        if initiated {
            local.start_break();
        }

        if local.deferred().push(suspend()).is_err() {
            return Err(Error::DeferFailed);
        }

        if !initiated {
            return Ok(None);
        }

        let owner = local.info().owner.clone();
        let new_level = if wants_write || local.level() == OplockLevel::Level2 {
            OplockLevel::None
        } else {
            OplockLevel::Level2
        };
        Ok(Some(BreakDispatch {
            session: local.session().clone(),
            tree_id: owner.tree_id,
            file_id: owner.file_id,
            new_level,
            queue: Arc::clone(local.deferred()),
        }))
    }

    /// Sends the captured break request and arms the timeout, outside any
    /// lock. A send failure fails the break immediately.
    async fn dispatch_break(self: &Arc<Self>, path: &PathKey, dispatch: Option<BreakDispatch>) {
        let Some(dispatch) = dispatch else { return };

        if self.config.debug_enabled(DebugFlags::OPLOCK) {
            debug!(
                target: "smb_mamont::oplock",
                %path,
                new_level = ?dispatch.new_level,
                "sending oplock break request"
            );
        }

        let sent = self
            .breaker
            .send_break(&dispatch.session, dispatch.tree_id, dispatch.file_id, dispatch.new_level)
            .await;

        match sent {
            Ok(()) => {
                if let Some(slot) = self.slot(path) {
                    if let Some(local) = slot.lock().oplock.as_mut() {
                        local.mark_break_sent(Instant::now());
                    }
                }
                let handler: Arc<dyn BreakTimeoutHandler> = Arc::clone(self) as Arc<dyn BreakTimeoutHandler>;
                self.breaker.start_timer(path.clone(), dispatch.queue, handler);
            }
            Err(error) => {
                debug!(target: "smb_mamont::oplock", %path, %error, "break send failed");
                self.mark_break_failed(path);
                self.breaker.fail_deferred(&dispatch.queue).await;
            }
        }
    }

    /// Reverses one grant. Returns the remaining open count. Idempotent
    /// per token. The owner's last close acknowledges a pending break.
    pub async fn release_access(&self, token: &mut AccessToken) -> Result<u32> {
        let Some(slot) = self.slot(&token.path) else {
            return Ok(0);
        };

        let (remaining, resume) = {
            let mut inner = slot.lock();
            let remaining = access::release_open(&mut inner.state, token);
            let resume = self.reconcile_oplock(&mut inner);
            if remaining == 0 {
                let ttl = self.state_ttl();
                inner.state.touch(ttl);
            }
            inner.state.check_invariants();
            (remaining, resume)
        };

        if let Some(queue) = resume {
            self.breaker.requeue_deferred(&token.path, &queue).await;
        }
        Ok(remaining)
    }

    /// Drops the local oplock machinery when the state no longer carries
    /// its descriptor. Returns the deferred queue to resume when a break
    /// was in progress.
    fn reconcile_oplock(&self, inner: &mut SlotInner) -> Option<Arc<DeferredQueue>> {
        if inner.state.oplock().is_some() {
            return None;
        }
        let mut local = inner.oplock.take()?;
        // The owner's close acknowledges an in-flight break.
        local.acknowledge().then(|| Arc::clone(local.deferred()))
    }

    /// Attaches an oplock to an already-open state.
    ///
    /// Returns false when the state is absent or has no opens; fails when
    /// another oplock is already attached.
    pub fn add_oplock(
        &self,
        path: &PathKey,
        level: OplockLevel,
        session: &SessionRef,
        owner: OplockOwner,
    ) -> Result<bool> {
        if level == OplockLevel::None {
            return Ok(false);
        }
        let Some(slot) = self.slot(path) else {
            return Ok(false);
        };
        let mut inner = slot.lock();
        if inner.state.open_count() == 0 {
            return Ok(false);
        }
        let info = OplockInfo::new(level, owner);
        inner.state.set_oplock(info.clone())?;
        inner.oplock = Some(LocalOplock::new(info, session.clone(), self.config.max_deferred));
        if self.config.debug_enabled(DebugFlags::OPLOCK) {
            debug!(target: "smb_mamont::oplock", %path, ?level, "oplock attached");
        }
        Ok(true)
    }

    /// Detaches the oplock, resuming any deferred requests.
    pub async fn clear_oplock(&self, path: &PathKey) -> Result<()> {
        let Some(slot) = self.slot(path) else {
            return Ok(());
        };
        let resume = {
            let mut inner = slot.lock();
            inner.state.clear_oplock();
            self.reconcile_oplock(&mut inner)
        };
        if let Some(queue) = resume {
            self.breaker.requeue_deferred(path, &queue).await;
        }
        Ok(())
    }

    /// Applies the owner's level change: a voluntary downgrade or the
    /// acknowledgement of a break request. Lowering to `None` clears the
    /// oplock. Returns the requeue counters when a break resolved.
    pub async fn change_oplock_type(
        &self,
        path: &PathKey,
        new_level: OplockLevel,
    ) -> Result<RequeueStats> {
        let Some(slot) = self.slot(path) else {
            return Ok(RequeueStats::default());
        };

        let resume = {
            let mut guard = slot.lock();
            let inner = &mut *guard;
            if inner.oplock.is_none() {
                inner.state.clear_oplock();
                return Ok(RequeueStats::default());
            }

            if new_level == OplockLevel::None {
                let mut local = inner.oplock.take().expect("checked above");
                // `InProgress -> Broken`; the terminal record then clears
                // together with the state's descriptor.
                let acknowledged = local.acknowledge();
                inner.state.clear_oplock();
                acknowledged.then(|| Arc::clone(local.deferred()))
            } else {
                let local = inner.oplock.as_mut().expect("checked above");
                // `InProgress -> Broken`, then re-arm at the lower level.
                let acknowledged = local.acknowledge();
                local.lower_to(new_level);
                let queue = Arc::clone(local.deferred());
                inner.state.change_oplock_level(new_level);
                if let Some(info) = inner.state.oplock_mut() {
                    info.break_in_progress = false;
                    info.break_failed = false;
                }
                acknowledged.then_some(queue)
            }
        };

        match resume {
            Some(queue) => Ok(self.breaker.requeue_deferred(path, &queue).await),
            None => Ok(RequeueStats::default()),
        }
    }

    /// Starts an oplock break on behalf of a non-open operation (byte
    /// lock, data op) hitting an oplocked file.
    ///
    /// Completes immediately when no effective oplock stands in the way;
    /// otherwise the request is suspended and the break protocol runs.
    pub async fn request_oplock_break(
        self: &Arc<Self>,
        path: &PathKey,
        requester_node: &NodeId,
        requester_session: SessionId,
        suspend: impl FnOnce() -> DeferredRequest,
    ) -> Result<Outcome<()>> {
        let Some(slot) = self.slot(path) else {
            return Ok(Outcome::Complete(()));
        };

        let dispatch = {
            let mut inner = slot.lock();
            let blocking = match inner.state.oplock() {
                Some(info)
                    if info.is_effective()
                        && !info.owned_by(requester_node, requester_session) =>
                {
                    true
                }
                _ => false,
            };
            if !blocking {
                return Ok(Outcome::Complete(()));
            }
            if inner.oplock.is_none() {
                inner.state.clear_oplock();
                return Ok(Outcome::Complete(()));
            }
            let initiated = !inner
                .state
                .oplock()
                .map(|info| info.break_in_progress)
                .unwrap_or(false);
            if initiated {
                if let Some(info) = inner.state.oplock_mut() {
                    info.break_in_progress = true;
                }
            }
            self.defer_request(&mut inner, initiated, true, suspend)?
        };

        self.dispatch_break(path, dispatch).await;
        Ok(Outcome::Deferred)
    }

    /// Adds a byte-range lock, breaking any standing oplock held by a
    /// different session first.
    pub async fn add_lock(
        self: &Arc<Self>,
        path: &PathKey,
        lock: ByteRangeLock,
        suspend: impl FnOnce() -> DeferredRequest,
    ) -> Result<Outcome<()>> {
        let Some(slot) = self.slot(path) else {
            return Err(Error::AccessDenied);
        };

        let dispatch = {
            let mut inner = slot.lock();
            let needs_break = match inner.state.oplock() {
                Some(info) => {
                    info.is_effective() && !info.owned_by(&lock.owner.node, lock.owner.session)
                }
                None => false,
            };
            if !needs_break {
                inner.state.locks_mut().add(lock)?;
                if self.config.debug_enabled(DebugFlags::BYTE_LOCK) {
                    debug!(
                        target: "smb_mamont::bytelock",
                        %path,
                        locks = inner.state.locks().len(),
                        "byte-range lock added"
                    );
                }
                return Ok(Outcome::Complete(()));
            }
            if inner.oplock.is_none() {
                inner.state.clear_oplock();
                inner.state.locks_mut().add(lock)?;
                return Ok(Outcome::Complete(()));
            }
            let initiated = !inner
                .state
                .oplock()
                .map(|info| info.break_in_progress)
                .unwrap_or(false);
            if initiated {
                if let Some(info) = inner.state.oplock_mut() {
                    info.break_in_progress = true;
                }
            }
            self.defer_request(&mut inner, initiated, true, suspend)?
        };

        self.dispatch_break(path, dispatch).await;
        Ok(Outcome::Deferred)
    }

    /// Removes the owner's lock with the exact range.
    pub fn remove_lock(
        &self,
        path: &PathKey,
        owner: &LockOwner,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        let slot = self.slot(path).ok_or(Error::NotLocked)?;
        let mut inner = slot.lock();
        inner.state.locks_mut().remove(owner, offset, length)?;
        Ok(())
    }

    /// Tells whether `owner` may read the range.
    pub fn can_read(&self, path: &PathKey, offset: u64, length: u64, owner: &LockOwner) -> bool {
        match self.slot(path) {
            Some(slot) => slot.lock().state.locks().can_read(offset, length, owner),
            None => true,
        }
    }

    /// Tells whether `owner` may write the range.
    pub fn can_write(&self, path: &PathKey, offset: u64, length: u64, owner: &LockOwner) -> bool {
        match self.slot(path) {
            Some(slot) => slot.lock().state.locks().can_write(offset, length, owner),
            None => true,
        }
    }

    /// Records a status (and optionally identity) update for the path.
    pub fn update_file_status(
        &self,
        path: &PathKey,
        status: FileStatus,
        file_id: Option<u64>,
    ) {
        let slot = self.ensure_slot(path, status);
        let mut inner = slot.lock();
        inner.state.set_status(status);
        if let Some(file_id) = file_id {
            if status != FileStatus::NotExist {
                inner.state.set_file_id(file_id);
            }
        }
        if self.config.debug_enabled(DebugFlags::FILE_STATUS) {
            debug!(target: "smb_mamont::cache", %path, ?status, "status updated");
        }
    }

    /// Stores a per-path attribute (cached metadata, segment descriptors).
    pub fn set_attribute(&self, path: &PathKey, name: &str, value: crate::state::AttrValue) {
        if let Some(slot) = self.slot(path) {
            slot.lock().state.attrs_mut().set(name, value);
        }
    }

    /// Reads back a per-path attribute.
    pub fn attribute(&self, path: &PathKey, name: &str) -> Option<crate::state::AttrValue> {
        let slot = self.slot(path)?;
        let inner = slot.lock();
        inner.state.attrs().get(name).cloned()
    }

    /// Marks this server as rewriting the file's data.
    pub fn set_data_update_in_progress(&self, path: &PathKey) {
        self.set_data_update(path, Some(self.node.clone()));
    }

    /// Clears the data-update marker.
    pub fn set_data_update_completed(&self, path: &PathKey) {
        self.set_data_update(path, None);
    }

    /// Marks the node currently rewriting the file's data, or clears the
    /// marker when `node` is `None`.
    pub fn set_data_update(&self, path: &PathKey, node: Option<NodeId>) {
        if let Some(slot) = self.slot(path) {
            let mut inner = slot.lock();
            inner.state.set_data_update_node(node.clone());
            if self.config.debug_enabled(DebugFlags::FILE_DATA_UPDATE) {
                debug!(target: "smb_mamont::cache", %path, ?node, "data update marker");
            }
        }
    }

    /// Removes the state, notifying `closed` listeners. Returns the
    /// removed snapshot, or `None` when nothing was cached. A pending
    /// break is failed: its deferred requests complete with access
    /// denied.
    pub async fn remove(&self, path: &PathKey) -> Option<FileState> {
        let (_, slot) = self.states.remove(path)?;
        let (snapshot, fail_queue) = {
            let mut inner = slot.lock();
            inner.reaped = true;
            let fail_queue = inner
                .oplock
                .take()
                .filter(|local| local.is_breaking())
                .map(|local| Arc::clone(local.deferred()));
            (inner.state.clone(), fail_queue)
        };
        if let Some(queue) = fail_queue {
            self.breaker.cancel_timer(path);
            self.breaker.fail_deferred(&queue).await;
        }
        self.notify(|listener| listener.state_closed(&snapshot));
        Some(snapshot)
    }

    /// Atomically repoints `old_path` (and, for directories, every cached
    /// descendant) to `new_path`. Attribute bags are cleared by the move.
    pub fn rename(&self, old_path: &PathKey, new_path: &PathKey, is_dir: bool) -> Result<()> {
        // Exclusive gate: a concurrent create on either key would either
        // vanish under the reinstated slot or observe a half-moved tree.
        let _moves = self.rename_gate.write().expect("rename gate poisoned");

        let (_, slot) = self.states.remove(old_path).ok_or(Error::FileNotFound)?;
        {
            let mut inner = slot.lock();
            inner.state.repoint(new_path.clone());
        }
        self.states.insert(new_path.clone(), slot);

        if is_dir {
            self.rename_descendants(old_path, new_path);
        }

        if self.config.debug_enabled(DebugFlags::RENAME) {
            debug!(target: "smb_mamont::cache", %old_path, %new_path, is_dir, "state renamed");
        }
        Ok(())
    }

    /// Moves every cached key under `old_path` to its `new_path`
    /// counterpart. Each move locks its own slot.
    pub(crate) fn rename_descendants(&self, old_path: &PathKey, new_path: &PathKey) -> usize {
        let descendants: Vec<PathKey> = self
            .states
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.is_descendant_of(old_path))
            .collect();

        let mut moved = 0;
        for key in descendants {
            let Some(rebased) = key.rebase(old_path, new_path) else { continue };
            let Some((_, slot)) = self.states.remove(&key) else { continue };
            {
                let mut inner = slot.lock();
                inner.state.repoint(rebased.clone());
            }
            self.states.insert(rebased, slot);
            moved += 1;
        }
        moved
    }

    /// Reaps every expired state. Returns how many were removed.
    ///
    /// Iteration snapshots the key set, so concurrent insertions are
    /// simply missed until the next pass; per-slot locks are taken one at
    /// a time.
    pub fn remove_expired(&self) -> usize {
        let now = clock::now_millis();
        let keys: Vec<PathKey> = self.states.iter().map(|entry| entry.key().clone()).collect();

        let mut reaped = Vec::new();
        for key in keys {
            let Some(slot) = self.slot(&key) else { continue };
            let snapshot = {
                let mut inner = slot.lock();
                if !inner.state.is_expired(now) {
                    continue;
                }
                inner.reaped = true;
                inner.state.clone()
            };
            self.states.remove(&key);
            reaped.push(snapshot);
        }

        let count = reaped.len();
        for snapshot in &reaped {
            self.notify(|listener| listener.state_expired(snapshot));
        }
        if count > 0 && self.config.debug_enabled(DebugFlags::EXPIRE) {
            debug!(target: "smb_mamont::cache", count, "expired states reaped");
        }
        count
    }

    /// Drops opens, locks and oplocks owned by a departed session.
    /// Used when a client connection is torn down without clean closes.
    pub async fn cleanup_session(&self, node: &NodeId, session: SessionId) {
        let keys: Vec<PathKey> = self.states.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            let Some(slot) = self.slot(&key) else { continue };
            let resume = {
                let mut inner = slot.lock();
                inner.state.locks_mut().remove_session_locks(node, session);

                let owned = inner
                    .state
                    .oplock()
                    .is_some_and(|info| info.owned_by(node, session));
                if owned {
                    inner.state.clear_oplock();
                }
                let resume = self.reconcile_oplock(&mut inner);

                let primary = inner
                    .state
                    .primary_owner()
                    .is_some_and(|o| o.node == *node && o.session == session);
                if primary {
                    inner.state.record_close(node);
                }
                resume
            };
            if let Some(queue) = resume {
                self.breaker.requeue_deferred(&key, &queue).await;
            }
        }
        if self.config.debug_enabled(DebugFlags::CLEANUP) {
            debug!(target: "smb_mamont::cache", %node, session = session.0, "session state cleaned");
        }
    }
}

impl BreakTimeoutHandler for LocalStateCache {
    fn mark_break_failed(&self, path: &PathKey) -> bool {
        let Some(slot) = self.slot(path) else {
            return false;
        };
        let mut inner = slot.lock();
        let Some(local) = inner.oplock.as_mut() else {
            return false;
        };
        if !local.fail() {
            return false;
        }
        if let Some(info) = inner.state.oplock_mut() {
            info.break_in_progress = false;
            info.break_failed = true;
        }
        true
    }
}
