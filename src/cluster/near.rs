//! Defines the per-node near cache of last-observed state snapshots.
//!
//! Validity is a hint, never a guarantee: every mutating path still goes
//! through a remote task, and invalidation messages are best-effort fast
//! paths on top of the time-to-live expiry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::clock;
use crate::path::PathKey;
use crate::state::FileState;

const NEAR_CACHE_CAPACITY: u64 = 4096;

/// One near-cache entry.
pub struct NearEntry {
    state: FileState,
    last_local_use: AtomicU64,
    last_remote_update: AtomicU64,
    valid: AtomicBool,
}

impl NearEntry {
    fn new(state: FileState, remote: bool) -> Self {
        let now = clock::now_millis();
        Self {
            state,
            last_local_use: AtomicU64::new(now),
            last_remote_update: AtomicU64::new(if remote { now } else { 0 }),
            valid: AtomicBool::new(true),
        }
    }

    pub fn state(&self) -> &FileState {
        &self.state
    }

    pub fn last_local_use(&self) -> u64 {
        self.last_local_use.load(Ordering::Relaxed)
    }

    pub fn last_remote_update(&self) -> u64 {
        self.last_remote_update.load(Ordering::Relaxed)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }
}

/// Bounded per-node snapshot cache with time-to-live expiry.
pub struct NearCache {
    entries: Cache<PathKey, Arc<NearEntry>>,
}

impl NearCache {
    /// Creates a cache whose entries live for `timeout` (already clamped
    /// by the configuration).
    pub fn new(timeout: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(NEAR_CACHE_CAPACITY)
            .time_to_live(timeout)
            .build();
        Self { entries }
    }

    /// Returns the cached snapshot, touching its local-use stamp. Invalid
    /// entries read as misses.
    pub fn get(&self, key: &PathKey) -> Option<FileState> {
        let entry = self.entries.get(key)?;
        if !entry.is_valid() {
            return None;
        }
        entry.last_local_use.store(clock::now_millis(), Ordering::Relaxed);
        Some(entry.state.clone())
    }

    /// Stores a snapshot observed by a local read or task reply.
    pub fn update_local(&self, key: &PathKey, state: FileState) {
        self.entries.insert(key.clone(), Arc::new(NearEntry::new(state, false)));
    }

    /// Stores a snapshot delivered by another node's state update.
    pub fn update_remote(&self, key: &PathKey, state: FileState) {
        self.entries.insert(key.clone(), Arc::new(NearEntry::new(state, true)));
    }

    /// Drops the entry.
    pub fn invalidate(&self, key: &PathKey) {
        self.entries.invalidate(key);
    }

    /// Flags the entry stale without dropping it; observed during remote
    /// task failures.
    pub fn mark_invalid(&self, key: &PathKey) {
        if let Some(entry) = self.entries.get(key) {
            entry.valid.store(false, Ordering::Relaxed);
        }
    }

    /// Keys currently cached. Snapshot semantics: concurrent mutation is
    /// tolerated.
    pub fn keys(&self) -> Vec<PathKey> {
        self.entries.iter().map(|(key, _)| key.as_ref().clone()).collect()
    }

    /// Moves every entry under `old_prefix` to its `new_prefix`
    /// counterpart. The repointed snapshots drop their attribute bags,
    /// matching what the partition owners do to the authoritative states.
    pub fn rename_descendants(&self, old_prefix: &PathKey, new_prefix: &PathKey) {
        for key in self.keys() {
            let Some(rebased) = key.rebase(old_prefix, new_prefix) else { continue };
            if let Some(entry) = self.entries.get(&key) {
                let mut state = entry.state.clone();
                state.repoint(rebased.clone());
                self.entries.insert(rebased, Arc::new(NearEntry::new(state, false)));
            }
            self.entries.invalidate(&key);
        }
    }
}
