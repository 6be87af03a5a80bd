//! Operator-facing consistency controls.
//!
//! The only control-plane surface a management layer gets: read whether a
//! promotion is blocked and what is waiting, and force the most recent
//! suspended transition through for manual disaster recovery.

use crate::consistency::{ConsistencyManager, TransitionRequest};
use crate::transport::GroupTransport;
use crate::types::{FailoverPolicy, NodeId};
use std::sync::Arc;
use tracing::{info, warn};

/// Management handle for one node's consistency manager.
#[derive(Clone)]
pub struct ConsistencyControl {
    node_id: NodeId,
    manager: Arc<ConsistencyManager>,
    transport: Arc<dyn GroupTransport>,
}

impl ConsistencyControl {
    pub fn new(node_id: NodeId, manager: Arc<ConsistencyManager>, transport: Arc<dyn GroupTransport>) -> Self {
        Self {
            node_id,
            manager,
            transport,
        }
    }

    pub fn policy(&self) -> FailoverPolicy {
        self.manager.policy()
    }

    pub fn is_blocked(&self) -> bool {
        self.manager.is_transition_blocked()
    }

    /// Blocked, and no voter is reachable that could unblock it.
    pub fn is_stuck(&self) -> bool {
        self.manager.is_stuck(&self.transport.members())
    }

    pub fn requested_actions(&self) -> Vec<TransitionRequest> {
        self.manager.requested_actions()
    }

    /// Force the most recent suspended transition. Returns what was released.
    pub fn allow_transition(&self) -> Option<TransitionRequest> {
        match self.manager.allow_transition() {
            Some(request) => {
                warn!(node_id = %self.node_id, request = %request, "operator allowed transition");
                Some(request)
            }
            None => {
                info!(node_id = %self.node_id, "allow_transition called with nothing suspended");
                None
            }
        }
    }

    /// Acknowledged and ignored; kept for operator tooling that calls it.
    pub fn reset(&self) {
        info!(node_id = %self.node_id, "Consistency control reset requested (no-op)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::VoteTally;
    use crate::transport::memory::MemoryNetwork;
    use crate::types::Role;

    #[tokio::test]
    async fn test_control_surface() {
        let net = MemoryNetwork::new();
        let endpoint = net.join("a");
        let manager = Arc::new(ConsistencyManager::new(
            NodeId::new("a"),
            FailoverPolicy::Consistency { voters: 1 },
            [NodeId::new("b")].into_iter().collect(),
        ));
        let control = ConsistencyControl::new(NodeId::new("a"), manager.clone(), endpoint.transport.clone());

        assert!(!control.is_blocked());
        assert!(control.allow_transition().is_none());

        manager.request_transition(Role::Passive, Role::Active, &NodeId::new("a"), &VoteTally::none());
        assert!(control.is_blocked());
        assert!(control.is_stuck());
        assert_eq!(control.requested_actions().len(), 1);

        let _b = net.join("b");
        assert!(!control.is_stuck());

        control.reset();
        assert!(control.is_blocked());

        let released = control.allow_transition().unwrap();
        assert_eq!(released.to, Role::Active);
        assert!(!control.is_blocked());
    }
}
