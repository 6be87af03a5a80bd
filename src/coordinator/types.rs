//! Node lifecycle and health types.
//!
//! # Lifecycle
//!
//! ```text
//!          start()
//! Starting ───────→ Running
//!    │                 │
//!    │ (startup error) │ shutdown() / kill() / zapped
//!    ↓                 ↓
//!  Failed         ShuttingDown ──→ Stopped
//! ```
//!
//! This is the process-level lifecycle of a [`ServerNode`](super::ServerNode),
//! separate from its stripe [`Role`].

use crate::types::{NodeId, Role};

/// Lifecycle of a server node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Reading persisted state and spawning tasks.
    Starting,

    /// Dispatch and election tasks are live.
    Running,

    /// Tasks are being stopped and the state store flushed.
    ShuttingDown,

    /// Done. Safe to drop or restart from the same state store.
    Stopped,

    /// Startup aborted. See logs.
    Failed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Starting => write!(f, "Starting"),
            NodeState::Running => write!(f, "Running"),
            NodeState::ShuttingDown => write!(f, "ShuttingDown"),
            NodeState::Stopped => write!(f, "Stopped"),
            NodeState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time health of one node.
///
/// Collected from cached state only; no network round trips.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub node_id: NodeId,
    pub state: NodeState,
    pub role: Role,
    /// The active this node currently follows (itself when active).
    pub known_active: Option<NodeId>,
    pub reachable_peers: usize,
    /// A promotion is parked by the failover policy.
    pub transition_blocked: bool,
    /// Outbound sync sessions queued or running.
    pub sync_sessions: usize,
    pub pending_acks: usize,
    /// Running, and settled as ACTIVE or PASSIVE.
    pub healthy: bool,
}
