//! SMB Mamont - the shared file-state subsystem of an SMB server.
//!
//! Coordinates, per share-relative path, the open handles, sharing modes,
//! byte-range locks, opportunistic locks and their break protocol, plus
//! the clustered variant of the same contract across server nodes.

pub mod access;
pub mod breaker;
pub mod buffer;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod defer;
pub mod error;
pub mod path;
pub mod session;
pub mod state;

mod clock;

pub use access::{AccessToken, CreateDisposition, OpenAction, OpenParams, Outcome};
pub use breaker::{BreakTransport, ResumedRequest, WorkerReceiver, WorkerSender};
pub use buffer::{BufferPool, MessageBuffer};
pub use cache::{LocalStateCache, StateListener};
pub use config::{CacheConfig, ClusterConfig, DebugFlags};
pub use defer::{DeferredRequest, RequeueStats};
pub use error::{Error, Result};
pub use path::PathKey;
pub use session::{NodeId, SessionId, SessionLiveness, SessionRef};
pub use state::{
    AttrValue, ByteRangeLock, FileState, FileStatus, LockOwner, OplockLevel, RequestedAccess,
    SharingMode,
};
