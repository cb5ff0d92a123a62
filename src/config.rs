//! Defines cache configuration --- [`CacheConfig`], [`ClusterConfig`] and
//! the per-subsystem [`DebugFlags`] gating diagnostic output.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default interval between expiry reaper passes.
pub const DEFAULT_EXPIRY_INTERVAL: Duration = Duration::from_secs(15);

/// Default capacity of the deferred-request queue attached to an oplock.
pub const DEFAULT_MAX_DEFERRED: usize = 3;

/// Default wall-clock timeout after which an unacknowledged oplock break
/// fails its deferred requests.
pub const DEFAULT_BREAK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default window granted to a deferred request's message buffer lease.
pub const DEFAULT_LEASE_WINDOW: Duration = Duration::from_secs(5);

/// Default lifetime of a near-cache entry.
pub const DEFAULT_NEAR_CACHE_TIMEOUT: Duration = Duration::from_secs(5);

/// Smallest accepted near-cache entry lifetime.
pub const MIN_NEAR_CACHE_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest accepted near-cache entry lifetime.
pub const MAX_NEAR_CACHE_TIMEOUT: Duration = Duration::from_secs(120);

/// Set of subsystems with diagnostic logging enabled.
///
/// Stored as a mask over the closed set of [`DebugFlags`] constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "Vec<String>")]
pub struct DebugFlags(u32);

impl DebugFlags {
    pub const STATE_CACHE: DebugFlags = DebugFlags(0x0001);
    pub const EXPIRE: DebugFlags = DebugFlags(0x0002);
    pub const NEAR_CACHE: DebugFlags = DebugFlags(0x0004);
    pub const OPLOCK: DebugFlags = DebugFlags(0x0008);
    pub const BYTE_LOCK: DebugFlags = DebugFlags(0x0010);
    pub const FILE_ACCESS: DebugFlags = DebugFlags(0x0020);
    pub const MEMBERSHIP: DebugFlags = DebugFlags(0x0040);
    pub const CLEANUP: DebugFlags = DebugFlags(0x0080);
    pub const PER_NODE: DebugFlags = DebugFlags(0x0100);
    pub const CLUSTER_ENTRY: DebugFlags = DebugFlags(0x0200);
    pub const CLUSTER_MESSAGE: DebugFlags = DebugFlags(0x0400);
    pub const REMOTE_TASK: DebugFlags = DebugFlags(0x0800);
    pub const REMOTE_TIMING: DebugFlags = DebugFlags(0x1000);
    pub const RENAME: DebugFlags = DebugFlags(0x2000);
    pub const FILE_DATA_UPDATE: DebugFlags = DebugFlags(0x4000);
    pub const FILE_STATUS: DebugFlags = DebugFlags(0x8000);

    /// Empty flag set.
    pub const NONE: DebugFlags = DebugFlags(0);

    /// All defined flags.
    pub const ALL: DebugFlags = DebugFlags(0xFFFF);

    /// Tells whether every flag in `other` is enabled.
    pub fn has(self, other: DebugFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of two flag sets.
    pub fn with(self, other: DebugFlags) -> DebugFlags {
        DebugFlags(self.0 | other.0)
    }

    fn from_name(name: &str) -> Option<DebugFlags> {
        let flag = match name {
            "StateCache" => Self::STATE_CACHE,
            "Expire" => Self::EXPIRE,
            "NearCache" => Self::NEAR_CACHE,
            "Oplock" => Self::OPLOCK,
            "ByteLock" => Self::BYTE_LOCK,
            "FileAccess" => Self::FILE_ACCESS,
            "Membership" => Self::MEMBERSHIP,
            "Cleanup" => Self::CLEANUP,
            "PerNode" => Self::PER_NODE,
            "ClusterEntry" => Self::CLUSTER_ENTRY,
            "ClusterMessage" => Self::CLUSTER_MESSAGE,
            "RemoteTask" => Self::REMOTE_TASK,
            "RemoteTiming" => Self::REMOTE_TIMING,
            "Rename" => Self::RENAME,
            "FileDataUpdate" => Self::FILE_DATA_UPDATE,
            "FileStatus" => Self::FILE_STATUS,
            _ => return None,
        };
        Some(flag)
    }
}

impl From<Vec<String>> for DebugFlags {
    fn from(names: Vec<String>) -> Self {
        let mut flags = DebugFlags::NONE;
        for name in &names {
            if let Some(flag) = DebugFlags::from_name(name) {
                flags = flags.with(flag);
            }
        }
        flags
    }
}

/// Configuration of a standalone file-state cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Path normalization policy. When false, keys fold case.
    pub case_sensitive: bool,
    /// Interval between expiry reaper passes.
    #[serde(with = "duration_secs")]
    pub expiry_interval: Duration,
    /// Capacity of the deferred-request queue attached to each oplock.
    pub max_deferred: usize,
    /// Wall-clock timeout after which an unacknowledged break fails.
    #[serde(with = "duration_secs")]
    pub break_timeout: Duration,
    /// Lease window granted to deferred message buffers.
    #[serde(with = "duration_secs")]
    pub lease_window: Duration,
    /// Subsystems with diagnostic logging enabled.
    pub debug: DebugFlags,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            expiry_interval: DEFAULT_EXPIRY_INTERVAL,
            max_deferred: DEFAULT_MAX_DEFERRED,
            break_timeout: DEFAULT_BREAK_TIMEOUT,
            lease_window: DEFAULT_LEASE_WINDOW,
            debug: DebugFlags::NONE,
        }
    }
}

impl CacheConfig {
    /// Parses configuration from a TOML document.
    pub fn from_toml(document: &str) -> Result<Self> {
        toml::from_str(document).map_err(|err| Error::Config(err.to_string()))
    }

    /// Tells whether diagnostic logging is enabled for the subsystem.
    pub fn debug_enabled(&self, flag: DebugFlags) -> bool {
        self.debug.has(flag)
    }
}

/// Configuration of the clustered file-state cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Standalone cache settings shared by the clustered variant.
    #[serde(flatten)]
    pub cache: CacheConfig,
    /// Name of the cluster this node joins.
    pub cluster_name: String,
    /// Name of the well-known topic carrying state messages.
    pub topic_name: String,
    /// Lifetime of a near-cache entry. Clamped by [`ClusterConfig::validate`].
    #[serde(with = "duration_secs")]
    pub near_cache_timeout: Duration,
    /// Whether `NotExist` state updates are broadcast to other nodes.
    pub send_not_exist_states: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            cluster_name: String::new(),
            topic_name: String::new(),
            near_cache_timeout: DEFAULT_NEAR_CACHE_TIMEOUT,
            send_not_exist_states: false,
        }
    }
}

impl ClusterConfig {
    /// Parses configuration from a TOML document.
    pub fn from_toml(document: &str) -> Result<Self> {
        toml::from_str(document).map_err(|err| Error::Config(err.to_string()))
    }

    /// Clamps the near-cache timeout into its accepted range and checks the
    /// required cluster identifiers.
    pub fn validate(mut self) -> Result<Self> {
        if self.cluster_name.is_empty() {
            return Err(Error::Config("cluster_name is required".to_owned()));
        }
        if self.topic_name.is_empty() {
            return Err(Error::Config("topic_name is required".to_owned()));
        }
        self.near_cache_timeout = self
            .near_cache_timeout
            .clamp(MIN_NEAR_CACHE_TIMEOUT, MAX_NEAR_CACHE_TIMEOUT);
        Ok(self)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

#[cfg(test)]
mod tests;
