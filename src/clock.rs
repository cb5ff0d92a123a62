//! Wall-clock helpers shared by expiry deadlines and buffer leases.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds elapsed since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Converts a duration into whole milliseconds, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
