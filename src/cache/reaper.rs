//! Background task that reaps expired file states.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::DebugFlags;

use super::LocalStateCache;

/// Single daemon task waking on the configured interval and sweeping the
/// cache for reapable states.
///
/// Holds only a weak handle: dropping the cache ends the task on its next
/// wake-up.
pub struct ExpiryReaper;

impl ExpiryReaper {
    /// Spawns the reaper for `cache`.
    pub fn spawn(cache: Arc<LocalStateCache>) -> JoinHandle<()> {
        let interval = cache.config().expiry_interval;
        let cache = Arc::downgrade(&cache);
        tokio::spawn(Self::run(cache, interval))
    }

    async fn run(cache: Weak<LocalStateCache>, interval: std::time::Duration) {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else { return };
            let reaped = cache.remove_expired();
            if reaped > 0 && cache.config().debug_enabled(DebugFlags::EXPIRE) {
                debug!(target: "smb_mamont::cache", reaped, "reaper pass finished");
            }
        }
    }
}
