//! Inbound message and membership dispatch.
//!
//! One task per node drains, in arrival order:
//! - group messages from the transport
//! - membership changes
//! - transitions released by the operator override
//!
//! Handlers never hold the view lock across an await.

use super::NodeShared;
use crate::consistency::{TransitionRequest, VoteTally};
use crate::metrics;
use crate::protocol::{AckRef, GroupMessage};
use crate::role::TransitionOutcome;
use crate::transport::{Inbound, MembershipEvent};
use crate::types::{NodeId, Role, StripeId};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

pub(super) async fn run_dispatch(
    shared: Arc<NodeShared>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    mut membership: broadcast::Receiver<MembershipEvent>,
    mut resolutions: broadcast::Receiver<TransitionRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut membership_open = true;
    let mut resolutions_open = true;

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            event = membership.recv(), if membership_open => match event {
                Ok(event) => on_membership(&shared, event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(node_id = %shared.node_id, missed, "Membership events lagged, re-announcing role");
                    for peer in shared.transport.members() {
                        let _ = shared.role.announce_to(&peer).await;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => membership_open = false,
            },

            request = resolutions.recv(), if resolutions_open => match request {
                Ok(request) => on_resolution(&shared, request).await,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => resolutions_open = false,
            },

            message = inbound.recv() => match message {
                Some(Inbound { from, message }) => on_message(&shared, from, message).await,
                None => {
                    debug!(node_id = %shared.node_id, "Inbound channel closed");
                    break;
                }
            },
        }
    }
    debug!(node_id = %shared.node_id, "Dispatch task stopped");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Group messages
// ═══════════════════════════════════════════════════════════════════════════════

async fn on_message(shared: &Arc<NodeShared>, from: NodeId, message: GroupMessage) {
    if shared.role.current() == Role::Stopped {
        return;
    }
    match message {
        GroupMessage::RoleAnnounce { role, stripe_id } => on_role_announce(shared, from, role, stripe_id).await,

        GroupMessage::VoteRequest { election, candidate } => {
            let verdict = shared.decide_vote(&candidate);
            metrics::record_vote(shared.node_id.as_str(), verdict.label());
            debug!(
                node_id = %shared.node_id,
                candidate = %candidate.node,
                election,
                verdict = verdict.label(),
                "Vote cast"
            );
            let response = GroupMessage::VoteResponse { election, verdict };
            if let Err(e) = shared.transport.send(&from, response).await {
                debug!(node_id = %shared.node_id, peer_id = %from, error = %e, "Vote response not delivered");
            }
            // The candidate evidently missed our announce.
            if shared.role.current() == Role::Active {
                let _ = shared.role.announce_to(&from).await;
            }
        }
        GroupMessage::VoteResponse { election, verdict } => {
            shared.election.record_response(from, election, verdict);
        }

        GroupMessage::SyncBegin { .. }
        | GroupMessage::SyncEntityBegin { .. }
        | GroupMessage::SyncEntity { .. }
        | GroupMessage::SyncEntityEnd { .. }
        | GroupMessage::SyncComplete { .. }
        | GroupMessage::Invoke { .. } => {
            if shared.known_active().as_ref() != Some(&from) {
                debug!(
                    node_id = %shared.node_id,
                    from = %from,
                    message_type = ?message.message_type(),
                    "Replication traffic from a node that is not the known active ignored"
                );
                return;
            }
            on_replication(shared, from, message).await;
        }

        GroupMessage::Ack { ack } => shared.sync.on_ack(&from, &ack),

        GroupMessage::Hello { .. } | GroupMessage::Goodbye { .. } | GroupMessage::Heartbeat { .. } => {}
    }
}

async fn on_role_announce(shared: &Arc<NodeShared>, from: NodeId, role: Role, stripe_id: StripeId) {
    if stripe_id != shared.stripe_id {
        warn!(
            node_id = %shared.node_id,
            from = %from,
            stripe_id = %stripe_id,
            expected = %shared.stripe_id,
            "Role announce for another stripe ignored"
        );
        return;
    }
    debug!(node_id = %shared.node_id, from = %from, role = %role, "Peer role");

    let lost_active = {
        let mut view = shared.view();
        if role == Role::Stopped {
            view.peer_roles.remove(&from);
        } else {
            view.peer_roles.insert(from.clone(), role);
        }
        if role != Role::Active && view.known_active.as_ref() == Some(&from) {
            view.known_active = None;
            view.synced_from = None;
            true
        } else {
            false
        }
    };

    if role == Role::Active {
        on_active_announced(shared, &from).await;
    } else if lost_active {
        info!(node_id = %shared.node_id, former = %from, role = %role, "Active stepped down");
        on_active_lost(shared).await;
    }

    if shared.role.current() == Role::Active {
        let _ = shared.sync.on_peer_role(&from, role);
    }
}

async fn on_active_announced(shared: &Arc<NodeShared>, active: &NodeId) {
    let local = shared.role.current();
    if local == Role::Active {
        if shared.node_id > *active {
            shared.zap(active).await;
        } else {
            warn!(node_id = %shared.node_id, other = %active, "Second active observed, asserting role");
            let _ = shared.role.announce_to(active).await;
        }
        return;
    }

    let synced_from = {
        let mut view = shared.view();
        view.known_active = Some(active.clone());
        view.synced_from.clone()
    };
    shared.role.abandon_deferred();

    match local {
        Role::Uninitialized => join_as_passive(shared, active).await,
        Role::Passive | Role::Syncing if synced_from.as_ref() != Some(active) => {
            info!(
                node_id = %shared.node_id,
                active = %active,
                synced_from = ?synced_from,
                "New active observed, resyncing from scratch"
            );
            shared.applier.discard().await;
            join_as_passive(shared, active).await;
        }
        Role::PassiveUninitialized => {
            // The active may not have seen our last announce.
            let _ = shared.role.announce_to(active).await;
        }
        _ => {}
    }
}

async fn join_as_passive(shared: &NodeShared, active: &NodeId) {
    if let Err(e) = shared.role.transition(Role::PassiveUninitialized, &VoteTally::none()).await {
        warn!(node_id = %shared.node_id, active = %active, error = %e, "Could not join as passive");
    }
}

/// The active this node followed is gone.
///
/// Another peer last seen ACTIVE is followed instead; otherwise an election
/// starts.
async fn on_active_lost(shared: &Arc<NodeShared>) {
    if shared.applier.in_session().await {
        shared.applier.discard().await;
    }
    if shared.role.current() == Role::Syncing {
        if let Err(e) = shared.role.transition(Role::PassiveUninitialized, &VoteTally::none()).await {
            warn!(node_id = %shared.node_id, error = %e, "Could not abandon sync");
        }
    }

    let successor = shared
        .view()
        .peer_roles
        .iter()
        .find(|(_, role)| **role == Role::Active)
        .map(|(peer, _)| peer.clone());
    match successor {
        Some(active) => {
            info!(node_id = %shared.node_id, active = %active, "Following remaining active");
            on_active_announced(shared, &active).await;
        }
        None => shared.kick_election(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Replication traffic (passive side)
// ═══════════════════════════════════════════════════════════════════════════════

async fn on_replication(shared: &NodeShared, active: NodeId, message: GroupMessage) {
    let local = shared.role.current();
    if !local.is_passive_family() {
        debug!(node_id = %shared.node_id, role = %local, "Replication traffic outside the passive roles ignored");
        return;
    }

    let ack = match message {
        GroupMessage::SyncBegin { session, entities } => {
            if local == Role::PassiveUninitialized {
                if let Err(e) = shared.role.transition(Role::Syncing, &VoteTally::none()).await {
                    warn!(node_id = %shared.node_id, session, error = %e, "Could not enter SYNCING");
                    return;
                }
            }
            shared.view().synced_from = Some(active.clone());
            Ok(Some(shared.applier.on_sync_begin(session, entities).await))
        }
        GroupMessage::SyncEntityBegin { session, entity, units } => {
            shared.applier.on_entity_begin(session, entity, units).await;
            Ok(None)
        }
        GroupMessage::SyncEntity { session, unit } => shared.applier.on_unit(session, unit).await,
        GroupMessage::SyncEntityEnd { session, entity } => shared.applier.on_entity_end(session, entity).await,
        GroupMessage::SyncComplete { session } => match shared.applier.on_sync_complete(session).await {
            Ok(Some(ack)) => {
                if shared.role.current() == Role::Syncing {
                    if let Err(e) = shared.role.transition(Role::Passive, &VoteTally::none()).await {
                        warn!(node_id = %shared.node_id, session, error = %e, "Could not enter PASSIVE");
                        return;
                    }
                }
                Ok(Some(ack))
            }
            other => other,
        },
        GroupMessage::Invoke { unit } => {
            if local == Role::PassiveUninitialized {
                debug!(node_id = %shared.node_id, entity = %unit.entity, "Invoke before sync began ignored");
                return;
            }
            shared.applier.on_invoke(unit).await.map(Some)
        }
        _ => return,
    };

    match ack {
        Ok(Some(ack)) => send_ack(shared, &active, ack).await,
        Ok(None) => {}
        Err(e) => warn!(node_id = %shared.node_id, active = %active, error = %e, "Replication message rejected"),
    }
}

async fn send_ack(shared: &NodeShared, to: &NodeId, ack: AckRef) {
    if let Err(e) = shared.transport.send(to, GroupMessage::Ack { ack }).await {
        debug!(node_id = %shared.node_id, peer_id = %to, error = %e, "Ack not delivered");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Membership
// ═══════════════════════════════════════════════════════════════════════════════

async fn on_membership(shared: &Arc<NodeShared>, event: MembershipEvent) {
    metrics::record_membership_event(event.kind());
    metrics::set_reachable_peers(shared.transport.members().len());
    if shared.role.current() == Role::Stopped {
        return;
    }
    debug!(node_id = %shared.node_id, event = %event, "Membership change");

    match event {
        MembershipEvent::Joined(peer) => {
            shared.view().departed.remove(&peer);
            if let Err(e) = shared.role.announce_to(&peer).await {
                debug!(node_id = %shared.node_id, peer_id = %peer, error = %e, "Announce to joined peer failed");
            }
            if shared.role.has_deferred() || shared.known_active().is_none() {
                shared.kick_election();
            }
        }
        MembershipEvent::Left(peer) => on_peer_lost(shared, peer, true).await,
        MembershipEvent::Suspected(peer) => on_peer_lost(shared, peer, false).await,
    }
}

async fn on_peer_lost(shared: &Arc<NodeShared>, peer: NodeId, graceful: bool) {
    let lost_active = {
        let mut view = shared.view();
        if graceful {
            view.departed.insert(peer.clone());
        }
        view.peer_roles.remove(&peer);
        if view.known_active.as_ref() == Some(&peer) {
            view.known_active = None;
            view.synced_from = None;
            true
        } else {
            false
        }
    };

    if shared.role.current() == Role::Active {
        shared.sync.on_peer_lost(&peer);
    }

    if lost_active {
        warn!(node_id = %shared.node_id, active = %peer, graceful, "Lost contact with the active");
        on_active_lost(shared).await;
    } else if shared.role.has_deferred() {
        shared.kick_election();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Operator overrides
// ═══════════════════════════════════════════════════════════════════════════════

async fn on_resolution(shared: &NodeShared, request: TransitionRequest) {
    if request.requester != shared.node_id {
        return;
    }
    match shared.role.complete_deferred(&request).await {
        Ok(TransitionOutcome::Applied { to: Role::Active, .. }) => {
            info!(node_id = %shared.node_id, request = %request, "Promotion released by operator");
            shared.on_became_active();
        }
        Ok(outcome) => debug!(node_id = %shared.node_id, request = %request, outcome = ?outcome, "Released transition"),
        Err(e) => warn!(node_id = %shared.node_id, request = %request, error = %e, "Released transition failed"),
    }
}
