//! Defines non-owning session handles used by oplock records and tokens.
//!
//! A session outlives no oplock, and an oplock never extends a session's
//! lifetime. The dispatcher keeps the owning [`SessionLiveness`] inside its
//! session object; the cache only ever holds [`SessionRef`]s and checks
//! liveness under the per-state lock before use.

use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

/// Identity of a cluster node. Standalone caches use a fixed local id.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().into())
    }

    /// Node id used by the standalone cache.
    pub fn local() -> Self {
        Self::new("local")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an SMB session within its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Liveness anchor owned by the dispatcher's session object.
///
/// Dropping it invalidates every [`SessionRef`] handed to the cache.
pub struct SessionLiveness(Arc<()>);

impl SessionLiveness {
    pub fn new() -> Self {
        Self(Arc::new(()))
    }
}

impl Default for SessionLiveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-owning handle to a dispatcher session.
#[derive(Clone)]
pub struct SessionRef {
    id: SessionId,
    node: NodeId,
    alive: Weak<()>,
}

impl SessionRef {
    /// Creates a handle bound to the given liveness anchor.
    pub fn new(id: SessionId, node: NodeId, liveness: &SessionLiveness) -> Self {
        Self { id, node, alive: Arc::downgrade(&liveness.0) }
    }

    /// Creates a handle that is never alive. Used for states reconstructed
    /// from remote snapshots, where the owner lives on another node.
    pub fn detached(id: SessionId, node: NodeId) -> Self {
        Self { id, node, alive: Weak::new() }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Check-then-use liveness probe. Callers hold the per-state lock for
    /// the check and must tolerate the session vanishing afterwards.
    pub fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRef")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("alive", &self.is_alive())
            .finish()
    }
}
