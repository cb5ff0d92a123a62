//! Defines the per-node sibling map holding data that must not cross the
//! network: local oplock machinery, deferred queues, locally-cached file
//! identities and non-serializable attributes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;

use crate::defer::DeferredQueue;
use crate::path::PathKey;
use crate::state::attr::AttrValue;
use crate::state::oplock::LocalOplock;

/// Node-local state for one path.
#[derive(Default)]
pub struct PerNodeState {
    /// Break machinery for an oplock whose owning session this node
    /// serves.
    pub oplock: Option<LocalOplock>,
    /// Requests this node suspended behind a break in progress anywhere
    /// in the cluster.
    pub deferred: Option<Arc<DeferredQueue>>,
    /// File identity tied to a node-local handle.
    pub file_id: Option<u64>,
    /// Attributes that cannot be serialized into the distributed state.
    pub attrs: HashMap<String, AttrValue>,
}

impl PerNodeState {
    /// Returns the deferred queue, creating it at `capacity` on first use.
    pub fn deferred_queue(&mut self, capacity: usize) -> Arc<DeferredQueue> {
        self.deferred
            .get_or_insert_with(|| Arc::new(DeferredQueue::new(capacity)))
            .clone()
    }
}

/// One entry of the per-node map.
pub struct PerNodeSlot {
    inner: Mutex<PerNodeState>,
}

impl PerNodeSlot {
    fn new() -> Self {
        Self { inner: Mutex::new(PerNodeState::default()) }
    }

    pub fn lock(&self) -> MutexGuard<'_, PerNodeState> {
        self.inner.lock().expect("per-node slot poisoned")
    }
}

/// Path-keyed map of node-local state, updated from invalidation
/// messages and local break activity.
#[derive(Default)]
pub struct PerNodeMap {
    slots: DashMap<PathKey, Arc<PerNodeSlot>>,
}

impl PerNodeMap {
    pub fn new() -> Self {
        Self { slots: DashMap::new() }
    }

    /// Clones the slot handle out of the map, if present.
    pub fn get(&self, path: &PathKey) -> Option<Arc<PerNodeSlot>> {
        self.slots.get(path).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the slot, creating an empty one when absent.
    pub fn ensure(&self, path: &PathKey) -> Arc<PerNodeSlot> {
        self.slots
            .entry(path.clone())
            .or_insert_with(|| Arc::new(PerNodeSlot::new()))
            .clone()
    }

    /// Drops the slot. Deferred queues must be drained first.
    pub fn remove(&self, path: &PathKey) -> Option<Arc<PerNodeSlot>> {
        self.slots.remove(path).map(|(_, slot)| slot)
    }

    /// Keys with node-local state.
    pub fn keys(&self) -> Vec<PathKey> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Moves every entry under `old_prefix` to its `new_prefix`
    /// counterpart.
    pub fn rename_descendants(&self, old_prefix: &PathKey, new_prefix: &PathKey) {
        for key in self.keys() {
            let Some(rebased) = key.rebase(old_prefix, new_prefix) else { continue };
            if let Some((_, slot)) = self.slots.remove(&key) {
                self.slots.insert(rebased, slot);
            }
        }
    }
}
