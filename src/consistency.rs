// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failover policy gate.
//!
//! Decides whether a requested role transition may proceed under the
//! stripe's [`FailoverPolicy`]:
//!
//! | Policy | Promotion to ACTIVE | Any other edge |
//! |--------|---------------------|----------------|
//! | `AVAILABILITY` | approved | approved |
//! | `CONSISTENCY(N)` | approved with N voter grants or proven sole survivorship, else deferred | approved |
//!
//! A deferred request is parked in the suspended list and shows up in
//! [`requested_actions`](ConsistencyManager::requested_actions). It leaves
//! the list when a later tally satisfies the quorum
//! ([`reevaluate`](ConsistencyManager::reevaluate)), when the operator
//! overrides ([`allow_transition`](ConsistencyManager::allow_transition)),
//! or when the requester cancels (e.g. it learned of a live active).
//!
//! Deferral is not an error. Callers poll `is_transition_blocked()` or
//! subscribe to resolutions.

use crate::metrics;
use crate::types::{FailoverPolicy, NodeId, Role};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A role change waiting on the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub from: Role,
    pub to: Role,
    pub requester: NodeId,
    pub requested_at: DateTime<Utc>,
}

impl fmt::Display for TransitionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.requester, self.from, self.to)
    }
}

/// Evidence a requester brings to a promotion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteTally {
    /// Peers that granted their vote in the current election.
    pub granted: BTreeSet<NodeId>,
    /// Every other configured server has left the stripe gracefully.
    pub sole_survivor: bool,
}

impl VoteTally {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_votes<I: IntoIterator<Item = NodeId>>(votes: I) -> Self {
        Self {
            granted: votes.into_iter().collect(),
            sole_survivor: false,
        }
    }

    pub fn sole_survivor() -> Self {
        Self {
            granted: BTreeSet::new(),
            sole_survivor: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionDecision {
    Approved,
    Deferred,
}

/// The narrow view of the policy gate the role state machine holds.
pub trait TransitionGate: Send + Sync {
    fn request_transition(&self, from: Role, to: Role, requester: &NodeId, tally: &VoteTally) -> TransitionDecision;

    /// Approve a parked request of `requester` if `tally` now satisfies the policy.
    fn reevaluate(&self, requester: &NodeId, tally: &VoteTally) -> Option<TransitionRequest>;

    fn cancel_pending(&self, requester: &NodeId) -> Option<TransitionRequest>;
}

/// Policy evaluation plus the suspended-request list.
pub struct ConsistencyManager {
    node_id: NodeId,
    policy: FailoverPolicy,
    voters: BTreeSet<NodeId>,
    suspended: Mutex<Vec<TransitionRequest>>,
    resolutions: broadcast::Sender<TransitionRequest>,
}

impl ConsistencyManager {
    /// `voters` are the peers whose grants count; the local node is never one.
    pub fn new(node_id: NodeId, policy: FailoverPolicy, voters: BTreeSet<NodeId>) -> Self {
        let (resolutions, _) = broadcast::channel(16);
        if let FailoverPolicy::Consistency { voters: needed } = policy {
            if needed > voters.len() {
                warn!(
                    node_id = %node_id,
                    needed,
                    configured = voters.len(),
                    "Quorum larger than voter set; promotion will need sole survivorship or an override"
                );
            }
        }
        Self {
            node_id,
            policy,
            voters,
            suspended: Mutex::new(Vec::new()),
            resolutions,
        }
    }

    pub fn policy(&self) -> FailoverPolicy {
        self.policy
    }

    pub fn voters(&self) -> &BTreeSet<NodeId> {
        &self.voters
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TransitionRequest>> {
        self.suspended.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish_blocked(&self, suspended: &[TransitionRequest]) {
        metrics::set_transition_blocked(self.node_id.as_str(), !suspended.is_empty());
    }

    fn is_gated(&self, to: Role) -> bool {
        to == Role::Active && matches!(self.policy, FailoverPolicy::Consistency { .. })
    }

    /// Whether `tally` is enough for a promotion.
    pub fn quorum_met(&self, tally: &VoteTally) -> bool {
        match self.policy {
            FailoverPolicy::Availability => true,
            FailoverPolicy::Consistency { voters: needed } => {
                if tally.sole_survivor {
                    return true;
                }
                let counted = tally.granted.intersection(&self.voters).count();
                counted >= needed
            }
        }
    }

    pub fn request_transition(&self, from: Role, to: Role, requester: &NodeId, tally: &VoteTally) -> TransitionDecision {
        let mut suspended = self.lock();
        suspended.retain(|r| &r.requester != requester);

        if !self.is_gated(to) || self.quorum_met(tally) {
            self.publish_blocked(&suspended);
            debug!(
                requester = %requester,
                from = %from,
                to = %to,
                votes = tally.granted.len(),
                sole_survivor = tally.sole_survivor,
                policy = %self.policy,
                "Transition approved"
            );
            return TransitionDecision::Approved;
        }

        let request = TransitionRequest {
            from,
            to,
            requester: requester.clone(),
            requested_at: Utc::now(),
        };
        warn!(
            request = %request,
            votes = tally.granted.len(),
            policy = %self.policy,
            "Transition deferred: quorum not reached"
        );
        metrics::record_transition_deferred(requester.as_str(), to);
        suspended.push(request);
        self.publish_blocked(&suspended);
        TransitionDecision::Deferred
    }

    pub fn reevaluate(&self, requester: &NodeId, tally: &VoteTally) -> Option<TransitionRequest> {
        let mut suspended = self.lock();
        let index = suspended.iter().position(|r| &r.requester == requester)?;
        if !self.quorum_met(tally) {
            return None;
        }
        let request = suspended.remove(index);
        self.publish_blocked(&suspended);
        info!(request = %request, votes = tally.granted.len(), "Deferred transition approved on re-evaluation");
        Some(request)
    }

    pub fn is_transition_blocked(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Blocked with no voter reachable to change the outcome.
    pub fn is_stuck(&self, reachable: &[NodeId]) -> bool {
        self.is_transition_blocked() && !reachable.iter().any(|n| self.voters.contains(n))
    }

    pub fn requested_actions(&self) -> Vec<TransitionRequest> {
        self.lock().clone()
    }

    /// Operator override: release the most recent suspended transition,
    /// bypassing the quorum. Resolution subscribers receive it.
    pub fn allow_transition(&self) -> Option<TransitionRequest> {
        let request = {
            let mut suspended = self.lock();
            let request = suspended.pop()?;
            self.publish_blocked(&suspended);
            request
        };
        warn!(request = %request, policy = %self.policy, "Operator allowed transition, quorum bypassed");
        metrics::record_transition_override(self.node_id.as_str());
        let _ = self.resolutions.send(request.clone());
        Some(request)
    }

    pub fn cancel_pending(&self, requester: &NodeId) -> Option<TransitionRequest> {
        let mut suspended = self.lock();
        let index = suspended.iter().position(|r| &r.requester == requester)?;
        let request = suspended.remove(index);
        self.publish_blocked(&suspended);
        info!(request = %request, "Suspended transition cancelled");
        Some(request)
    }

    pub fn subscribe_resolutions(&self) -> broadcast::Receiver<TransitionRequest> {
        self.resolutions.subscribe()
    }
}

impl TransitionGate for ConsistencyManager {
    fn request_transition(&self, from: Role, to: Role, requester: &NodeId, tally: &VoteTally) -> TransitionDecision {
        ConsistencyManager::request_transition(self, from, to, requester, tally)
    }

    fn reevaluate(&self, requester: &NodeId, tally: &VoteTally) -> Option<TransitionRequest> {
        ConsistencyManager::reevaluate(self, requester, tally)
    }

    fn cancel_pending(&self, requester: &NodeId) -> Option<TransitionRequest> {
        ConsistencyManager::cancel_pending(self, requester)
    }
}
