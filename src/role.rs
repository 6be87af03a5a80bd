// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-node role lifecycle.
//!
//! Every transition goes through the same four steps:
//!
//! ```text
//! propose ──► gate (policy) ──► persist ──► apply ──► announce
//!               │
//!               └── deferred: parked until re-evaluated or overridden
//! ```
//!
//! At most one transition is pending per node. A second proposal while one
//! is pending (deferred or mid-persist) is rejected with
//! [`CoordinatorError::TransitionInProgress`]. STOPPED is the exception: it
//! always wins, cancels whatever was pending and is never persisted.
//!
//! The role is published on a `watch` channel so tasks can await changes.

use crate::consistency::{TransitionDecision, TransitionGate, TransitionRequest, VoteTally};
use crate::error::{BoxFuture, CoordinatorError, Result};
use crate::metrics;
use crate::protocol::GroupMessage;
use crate::state_store::ClusterStateStore;
use crate::transport::GroupTransport;
use crate::types::{NodeId, Role, StripeId};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where committed roles are written before they take effect.
pub trait RolePersistence: Send + Sync {
    fn persisted_role(&self) -> BoxFuture<'_, Option<Role>>;

    fn persist_role<'a>(&'a self, role: Role, stripe: &'a StripeId) -> BoxFuture<'a, ()>;

    /// Undo a `persist_role` whose transition never took effect.
    fn restore_role(&self, role: Option<Role>) -> BoxFuture<'_, ()>;
}

impl RolePersistence for ClusterStateStore {
    fn persisted_role(&self) -> BoxFuture<'_, Option<Role>> {
        Box::pin(self.current_role())
    }

    fn persist_role<'a>(&'a self, role: Role, stripe: &'a StripeId) -> BoxFuture<'a, ()> {
        Box::pin(self.commit_role(role, stripe))
    }

    fn restore_role(&self, role: Option<Role>) -> BoxFuture<'_, ()> {
        Box::pin(self.rollback_role(role))
    }
}

/// Result of a transition proposal that was not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { from: Role, to: Role },
    /// Already in the requested role.
    Unchanged,
    /// Parked by the failover policy.
    Deferred,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    from: Role,
    to: Role,
    deferred: bool,
}

pub struct RoleStateMachine {
    node_id: NodeId,
    stripe_id: StripeId,
    role_tx: watch::Sender<Role>,
    pending: Mutex<Option<Pending>>,
    gate: Arc<dyn TransitionGate>,
    persistence: Arc<dyn RolePersistence>,
    transport: Arc<dyn GroupTransport>,
}

impl RoleStateMachine {
    /// A machine in UNINITIALIZED. Whatever role was persisted is only a
    /// hint for elections; it is never trusted as the starting role.
    pub fn new(
        node_id: NodeId,
        stripe_id: StripeId,
        gate: Arc<dyn TransitionGate>,
        persistence: Arc<dyn RolePersistence>,
        transport: Arc<dyn GroupTransport>,
    ) -> Self {
        let (role_tx, _) = watch::channel(Role::Uninitialized);
        metrics::set_role(node_id.as_str(), Role::Uninitialized);
        Self {
            node_id,
            stripe_id,
            role_tx,
            pending: Mutex::new(None),
            gate,
            persistence,
            transport,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn stripe_id(&self) -> &StripeId {
        &self.stripe_id
    }

    pub fn current(&self) -> Role {
        *self.role_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Target of the pending transition, if any.
    pub fn pending_target(&self) -> Option<Role> {
        self.lock_pending().map(|p| p.to)
    }

    pub fn has_deferred(&self) -> bool {
        self.lock_pending().map_or(false, |p| p.deferred)
    }

    /// Propose `current -> to`.
    pub async fn transition(&self, to: Role, tally: &VoteTally) -> Result<TransitionOutcome> {
        let from = self.current();
        if from == to {
            return Ok(TransitionOutcome::Unchanged);
        }
        if to == Role::Stopped {
            self.stop("requested").await;
            return Ok(TransitionOutcome::Applied { from, to });
        }
        if !from.can_transition_to(to) {
            return Err(CoordinatorError::InvalidTransition { from, to });
        }

        {
            let mut pending = self.lock_pending();
            if let Some(p) = *pending {
                return Err(CoordinatorError::TransitionInProgress { from: p.from, to: p.to });
            }
            *pending = Some(Pending {
                from,
                to,
                deferred: false,
            });
        }

        match self.gate.request_transition(from, to, &self.node_id, tally) {
            TransitionDecision::Deferred => {
                if let Some(p) = self.lock_pending().as_mut() {
                    p.deferred = true;
                }
                warn!(node_id = %self.node_id, from = %from, to = %to, "Transition deferred by failover policy");
                Ok(TransitionOutcome::Deferred)
            }
            TransitionDecision::Approved => self.commit(from, to).await,
        }
    }

    /// Apply a deferred transition released by the operator.
    pub async fn complete_deferred(&self, request: &TransitionRequest) -> Result<TransitionOutcome> {
        if request.requester != self.node_id {
            return Ok(TransitionOutcome::Unchanged);
        }
        let pending = *self.lock_pending();
        match pending {
            Some(p) if p.deferred && p.to == request.to => {
                if self.current() != p.from {
                    self.clear_pending();
                    return Err(CoordinatorError::InvalidTransition {
                        from: self.current(),
                        to: p.to,
                    });
                }
                if let Some(p) = self.lock_pending().as_mut() {
                    p.deferred = false;
                }
                self.commit(p.from, p.to).await
            }
            _ => {
                debug!(node_id = %self.node_id, request = %request, "Released transition no longer pending");
                Ok(TransitionOutcome::Unchanged)
            }
        }
    }

    /// Re-run the policy for a deferred transition with a fresh tally.
    pub async fn retry_deferred(&self, tally: &VoteTally) -> Result<TransitionOutcome> {
        if !self.has_deferred() {
            return Ok(TransitionOutcome::Unchanged);
        }
        match self.gate.reevaluate(&self.node_id, tally) {
            Some(request) => self.complete_deferred(&request).await,
            None => Ok(TransitionOutcome::Deferred),
        }
    }

    /// Drop a deferred transition (e.g. another node became active).
    pub fn abandon_deferred(&self) -> bool {
        let mut pending = self.lock_pending();
        let p = match *pending {
            Some(p) if p.deferred => p,
            _ => return false,
        };
        *pending = None;
        drop(pending);
        self.gate.cancel_pending(&self.node_id);
        info!(node_id = %self.node_id, from = %p.from, to = %p.to, "Deferred transition abandoned");
        true
    }

    fn clear_pending(&self) {
        *self.lock_pending() = None;
    }

    async fn commit(&self, from: Role, to: Role) -> Result<TransitionOutcome> {
        let result = self.persist_and_apply(from, to).await;
        self.clear_pending();
        result
    }

    async fn persist_and_apply(&self, from: Role, to: Role) -> Result<TransitionOutcome> {
        let previous = self.persistence.persisted_role().await?;
        if let Err(e) = self.persistence.persist_role(to, &self.stripe_id).await {
            warn!(node_id = %self.node_id, from = %from, to = %to, error = %e, "Failed to persist role, transition aborted");
            return Err(e);
        }

        let applied = self.role_tx.send_if_modified(|role| {
            if *role == from {
                *role = to;
                true
            } else {
                false
            }
        });
        if !applied {
            // Stopped or halted mid-commit: the disk must not claim `to`.
            if let Err(e) = self.persistence.restore_role(previous).await {
                warn!(node_id = %self.node_id, to = %to, error = %e, "Failed to roll back persisted role");
            }
            return Err(CoordinatorError::InvalidTransition {
                from: self.current(),
                to,
            });
        }

        info!(node_id = %self.node_id, from = %from, to = %to, "Role transition");
        metrics::record_role_transition(self.node_id.as_str(), from, to);
        self.announce(to).await;
        Ok(TransitionOutcome::Applied { from, to })
    }

    async fn announce(&self, role: Role) {
        let message = GroupMessage::RoleAnnounce {
            role,
            stripe_id: self.stripe_id.clone(),
        };
        match self.transport.broadcast(message).await {
            Ok(report) => {
                for (peer, result) in report {
                    if let Err(e) = result {
                        debug!(node_id = %self.node_id, peer_id = %peer, error = %e, "Role announce not delivered");
                    }
                }
            }
            Err(e) => debug!(node_id = %self.node_id, error = %e, "Role announce failed"),
        }
    }

    /// Re-send the current role to one peer (e.g. after it joined).
    pub async fn announce_to(&self, peer: &NodeId) -> Result<()> {
        let message = GroupMessage::RoleAnnounce {
            role: self.current(),
            stripe_id: self.stripe_id.clone(),
        };
        self.transport.send(peer, message).await
    }

    /// Move to STOPPED. Cancels any pending transition and announces.
    pub async fn stop(&self, reason: &str) {
        let from = self.current();
        if from == Role::Stopped {
            return;
        }
        self.clear_pending();
        self.gate.cancel_pending(&self.node_id);
        self.role_tx.send_replace(Role::Stopped);
        info!(node_id = %self.node_id, from = %from, to = %Role::Stopped, reason, "Role transition");
        metrics::record_role_transition(self.node_id.as_str(), from, Role::Stopped);
        self.announce(Role::Stopped).await;
    }

    /// Move to STOPPED without announcing. Used when the node dies abruptly.
    pub fn halt(&self) {
        let from = self.role_tx.send_replace(Role::Stopped);
        if from != Role::Stopped {
            self.clear_pending();
            self.gate.cancel_pending(&self.node_id);
            metrics::record_role_transition(self.node_id.as_str(), from, Role::Stopped);
            debug!(node_id = %self.node_id, from = %from, "Role halted");
        }
    }
}
