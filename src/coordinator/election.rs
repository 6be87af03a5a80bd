// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Elections for the ACTIVE role.
//!
//! A node with no known active that may legally promote (UNINITIALIZED or
//! PASSIVE) runs rounds until it wins, learns of an active, or is parked by
//! the failover policy:
//!
//! ```text
//! claim own vote ──► broadcast VoteRequest ──► collect until all answered
//!       │                                       or vote_timeout
//!       │ (voted for someone else                 │
//!       │  within the lease)                      ├─ any denial ──► yield, retry later
//!       ▼                                         │
//!     yield                                       └─ propose ACTIVE with the tally
//! ```
//!
//! Voters grant at most one candidate per lease, and only a candidate at
//! least as strong as themselves. A candidate that receives a request from
//! a stronger one hands its own vote over and abandons its round.

use super::NodeShared;
use crate::consistency::VoteTally;
use crate::metrics;
use crate::protocol::{CandidatePriority, DenyReason, GroupMessage, VoteVerdict};
use crate::role::TransitionOutcome;
use crate::types::{NodeId, Role};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Vote keeper
// ═══════════════════════════════════════════════════════════════════════════════

/// One node's ballot box: who it voted for and until when.
#[derive(Debug)]
pub(super) struct VoteKeeper {
    lease: Duration,
    grant: Option<(NodeId, Instant)>,
    promoting: bool,
}

impl VoteKeeper {
    pub(super) fn new(lease: Duration) -> Self {
        Self {
            lease,
            grant: None,
            promoting: false,
        }
    }

    fn current(&self, now: Instant) -> Option<&NodeId> {
        match &self.grant {
            Some((node, at)) if now.saturating_duration_since(*at) < self.lease => Some(node),
            _ => None,
        }
    }

    /// Answer a vote request. `own` is this node's strength when it could
    /// stand itself.
    pub(super) fn consider(
        &mut self,
        local: &NodeId,
        own: Option<&CandidatePriority>,
        candidate: &CandidatePriority,
        now: Instant,
    ) -> VoteVerdict {
        if self.promoting {
            return VoteVerdict::Denied(DenyReason::ActiveExists(local.clone()));
        }
        if let Some(own) = own {
            if own > candidate {
                return VoteVerdict::Denied(DenyReason::BetterCandidate(local.clone()));
            }
        }
        match self.current(now).cloned() {
            Some(granted) if granted != candidate.node && &granted != local => {
                VoteVerdict::Denied(DenyReason::AlreadyVoted(granted))
            }
            _ => {
                self.grant = Some((candidate.node.clone(), now));
                VoteVerdict::Granted
            }
        }
    }

    /// Take our own vote. Fails while it is leased to someone else.
    pub(super) fn claim(&mut self, local: &NodeId, now: Instant) -> bool {
        match self.current(now) {
            Some(granted) if granted != local => false,
            _ => {
                self.grant = Some((local.clone(), now));
                true
            }
        }
    }

    /// Commit to promoting, unless the vote was handed to someone else.
    pub(super) fn begin_promotion(&mut self, local: &NodeId, now: Instant) -> bool {
        if !self.claim(local, now) {
            return false;
        }
        self.promoting = true;
        true
    }

    pub(super) fn end_promotion(&mut self) {
        self.promoting = false;
    }

    /// Give back our own vote.
    pub(super) fn release(&mut self, local: &NodeId) {
        if matches!(&self.grant, Some((node, _)) if node == local) {
            self.grant = None;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Election state
// ═══════════════════════════════════════════════════════════════════════════════

struct Ballot {
    election: u64,
    responses: mpsc::UnboundedSender<(NodeId, VoteVerdict)>,
}

pub(super) struct ElectionState {
    keeper: Mutex<VoteKeeper>,
    ballot: Mutex<Option<Ballot>>,
    next_election: AtomicU64,
}

impl ElectionState {
    pub(super) fn new(lease: Duration) -> Self {
        Self {
            keeper: Mutex::new(VoteKeeper::new(lease)),
            ballot: Mutex::new(None),
            next_election: AtomicU64::new(chrono::Utc::now().timestamp_millis().max(1) as u64),
        }
    }

    fn keeper(&self) -> MutexGuard<'_, VoteKeeper> {
        self.keeper.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open_ballot(&self) -> (u64, mpsc::UnboundedReceiver<(NodeId, VoteVerdict)>) {
        let election = self.next_election.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.ballot.lock().unwrap_or_else(|p| p.into_inner()) = Some(Ballot {
            election,
            responses: tx,
        });
        (election, rx)
    }

    fn close_ballot(&self) {
        *self.ballot.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Route a vote response to the open ballot. Stale elections are dropped.
    pub(super) fn record_response(&self, from: NodeId, election: u64, verdict: VoteVerdict) -> bool {
        let ballot = self.ballot.lock().unwrap_or_else(|p| p.into_inner());
        match ballot.as_ref() {
            Some(b) if b.election == election => b.responses.send((from, verdict)).is_ok(),
            _ => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Voter side
// ═══════════════════════════════════════════════════════════════════════════════

fn can_stand(role: Role) -> bool {
    matches!(role, Role::Uninitialized | Role::Passive)
}

impl NodeShared {
    fn own_priority(&self) -> CandidatePriority {
        CandidatePriority {
            was_active: self.was_active,
            node: self.node_id.clone(),
        }
    }

    /// Answer a peer's vote request.
    pub(super) fn decide_vote(&self, candidate: &CandidatePriority) -> VoteVerdict {
        let role = self.role.current();
        match role {
            Role::Stopped => return VoteVerdict::Denied(DenyReason::Ineligible),
            Role::Active => return VoteVerdict::Denied(DenyReason::ActiveExists(self.node_id.clone())),
            _ => {}
        }
        if let Some(active) = self.known_active() {
            if active != candidate.node {
                return VoteVerdict::Denied(DenyReason::ActiveExists(active));
            }
        }
        let own = can_stand(role).then(|| self.own_priority());
        self.election
            .keeper()
            .consider(&self.node_id, own.as_ref(), candidate, Instant::now())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Candidate side
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
enum RoundOutcome {
    Won,
    /// Nothing to elect: an active is known or this node cannot stand.
    Settled,
    /// The promotion is parked by the failover policy.
    Blocked,
    Yielded(String),
}

async fn run_round(shared: &NodeShared) -> RoundOutcome {
    let role = shared.role.current();
    if !can_stand(role) || shared.known_active().is_some() {
        return RoundOutcome::Settled;
    }
    let node_id = &shared.node_id;
    if !shared.election.keeper().claim(node_id, Instant::now()) {
        return RoundOutcome::Yielded("vote leased to another candidate".to_string());
    }

    let (election, mut responses) = shared.election.open_ballot();
    let request = GroupMessage::VoteRequest {
        election,
        candidate: shared.own_priority(),
    };
    let mut waiting: HashSet<NodeId> = match shared.transport.broadcast(request).await {
        Ok(report) => report
            .into_iter()
            .filter_map(|(peer, result)| result.ok().map(|_| peer))
            .collect(),
        Err(e) => {
            debug!(node_id = %node_id, error = %e, "Vote request broadcast failed");
            HashSet::new()
        }
    };
    let asked = waiting.len();

    let deadline = tokio::time::Instant::now() + shared.config.settings.election.vote_timeout_duration();
    let mut granted = BTreeSet::new();
    let mut denial: Option<(NodeId, DenyReason)> = None;
    while !waiting.is_empty() {
        match tokio::time::timeout_at(deadline, responses.recv()).await {
            Ok(Some((from, verdict))) => {
                if !waiting.remove(&from) {
                    continue;
                }
                match verdict {
                    VoteVerdict::Granted => {
                        granted.insert(from);
                    }
                    VoteVerdict::Denied(reason) => {
                        denial.get_or_insert((from, reason));
                    }
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    shared.election.close_ballot();

    if let Some((from, reason)) = denial {
        shared.election.keeper().release(node_id);
        return RoundOutcome::Yielded(format!("{} denied: {:?}", from, reason));
    }
    if shared.known_active().is_some() {
        shared.election.keeper().release(node_id);
        return RoundOutcome::Settled;
    }
    if !shared.election.keeper().begin_promotion(node_id, Instant::now()) {
        return RoundOutcome::Yielded("handed vote to a stronger candidate".to_string());
    }

    let tally = if shared.is_sole_survivor() {
        VoteTally {
            sole_survivor: true,
            granted,
        }
    } else {
        VoteTally::from_votes(granted)
    };
    info!(
        node_id = %node_id,
        election,
        asked,
        granted = tally.granted.len(),
        sole_survivor = tally.sole_survivor,
        "Election round complete, requesting promotion"
    );

    let result = if shared.role.has_deferred() {
        shared.role.retry_deferred(&tally).await
    } else {
        shared.role.transition(Role::Active, &tally).await
    };
    shared.election.keeper().end_promotion();

    match result {
        Ok(TransitionOutcome::Applied { to: Role::Active, .. }) => RoundOutcome::Won,
        Ok(TransitionOutcome::Deferred) => RoundOutcome::Blocked,
        Ok(_) => RoundOutcome::Settled,
        Err(e) => RoundOutcome::Yielded(e.to_string()),
    }
}

/// Run rounds until the question of who is active is settled for now.
async fn campaign(shared: &NodeShared, shutdown_rx: &mut watch::Receiver<bool>) {
    let started = Instant::now();
    let retry_delay = shared.config.settings.election.retry_delay_duration();
    let mut rounds = 0u32;

    loop {
        rounds += 1;
        match run_round(shared).await {
            RoundOutcome::Won => {
                metrics::record_election(shared.node_id.as_str(), "won", started.elapsed());
                info!(node_id = %shared.node_id, rounds, "Won election");
                shared.on_became_active();
                return;
            }
            RoundOutcome::Settled => return,
            RoundOutcome::Blocked => {
                metrics::record_election(shared.node_id.as_str(), "blocked", started.elapsed());
                warn!(
                    node_id = %shared.node_id,
                    rounds,
                    "Promotion blocked by failover policy; waiting for membership change or operator"
                );
                return;
            }
            RoundOutcome::Yielded(reason) => {
                debug!(node_id = %shared.node_id, round = rounds, reason = %reason, "Election round yielded");
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = shutdown_rx.changed() => return,
                }
            }
        }
    }
}

/// Election task: waits out the discovery window, then campaigns whenever kicked.
pub(super) async fn run_elections(shared: Arc<NodeShared>, mut shutdown_rx: watch::Receiver<bool>) {
    let discovery = shared.config.settings.election.discovery_window_duration();
    tokio::select! {
        _ = tokio::time::sleep(discovery) => {}
        _ = shutdown_rx.changed() => return,
    }
    debug!(node_id = %shared.node_id, known_active = ?shared.known_active(), "Discovery window closed");
    shared.kick_election();

    loop {
        tokio::select! {
            _ = shared.election_kick.notified() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
        campaign(&shared, &mut shutdown_rx).await;
    }
    debug!(node_id = %shared.node_id, "Election task stopped");
}
