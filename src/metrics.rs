//! Metrics for observability.
//!
//! Emitted through the `metrics` facade; installing an exporter is the
//! embedding application's job. Covers:
//! - Role and role transitions
//! - Votes, elections, deferred and overridden transitions
//! - Passive sync progress
//! - Peer links and membership events
//! - Framing errors
//! - Cluster state store writes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `stripe_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations in seconds
//!
//! # Usage
//!
//! ```rust,no_run
//! use stripe_coordinator::metrics;
//! use stripe_coordinator::types::Role;
//!
//! metrics::record_role_transition("node-1", Role::Passive, Role::Active);
//! metrics::set_transition_blocked("node-1", true);
//! ```

use crate::types::Role;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Roles and transitions
// ═══════════════════════════════════════════════════════════════════════════════

/// Set the role gauge (0=UNINITIALIZED .. 4=ACTIVE, 5=STOPPED).
pub fn set_role(node_id: &str, role: Role) {
    gauge!("stripe_role", "node_id" => node_id.to_string()).set(role.code() as f64);
}

/// Record an applied role transition.
pub fn record_role_transition(node_id: &str, from: Role, to: Role) {
    counter!(
        "stripe_role_transitions_total",
        "node_id" => node_id.to_string(),
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
    set_role(node_id, to);
}

/// Record a transition parked by the failover policy.
pub fn record_transition_deferred(node_id: &str, to: Role) {
    counter!("stripe_transitions_deferred_total", "node_id" => node_id.to_string(), "to" => to.as_str())
        .increment(1);
}

/// Record an operator override.
pub fn record_transition_override(node_id: &str) {
    counter!("stripe_transition_overrides_total", "node_id" => node_id.to_string()).increment(1);
}

pub fn set_transition_blocked(node_id: &str, blocked: bool) {
    gauge!("stripe_transition_blocked", "node_id" => node_id.to_string()).set(if blocked { 1.0 } else { 0.0 });
}

/// Record a node zapped to STOPPED by split-brain resolution.
pub fn record_zap(node_id: &str) {
    counter!("stripe_zaps_total", "node_id" => node_id.to_string()).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Elections
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a vote cast by this node.
pub fn record_vote(node_id: &str, verdict: &str) {
    counter!("stripe_votes_total", "node_id" => node_id.to_string(), "verdict" => verdict.to_string())
        .increment(1);
}

/// Record how an election round ended.
pub fn record_election(node_id: &str, outcome: &str, duration: Duration) {
    counter!("stripe_elections_total", "node_id" => node_id.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    histogram!("stripe_election_seconds", "node_id" => node_id.to_string()).record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════════
// Passive sync
// ═══════════════════════════════════════════════════════════════════════════════

pub fn record_sync_unit_sent(target: &str) {
    counter!("stripe_sync_units_sent_total", "target" => target.to_string()).increment(1);
}

/// Record units applied on a passive. `outcome` is "applied" or "duplicate".
pub fn record_sync_units_applied(outcome: &str, count: usize) {
    counter!("stripe_sync_units_applied_total", "outcome" => outcome.to_string()).increment(count as u64);
}

/// Record a finished sync session. `outcome` is "completed", "retried" or "failed".
pub fn record_sync_session(target: &str, outcome: &str, duration: Duration) {
    counter!("stripe_sync_sessions_total", "target" => target.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    histogram!("stripe_sync_session_seconds", "target" => target.to_string()).record(duration.as_secs_f64());
}

pub fn set_sync_sessions_active(count: usize) {
    gauge!("stripe_sync_sessions_active").set(count as f64);
}

/// Record staged units dropped because the sync source went away.
pub fn record_sync_staging_discarded(count: usize) {
    counter!("stripe_sync_staging_discarded_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════════════

pub fn record_peer_connection(peer_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("stripe_peer_connections_total", "peer_id" => peer_id.to_string(), "status" => status).increment(1);
}

pub fn record_peer_state(peer_id: &str, state: &str) {
    gauge!("stripe_peer_state", "peer_id" => peer_id.to_string(), "state" => state.to_string()).set(1.0);
}

/// Record a membership event. `kind` is "joined", "left" or "suspected".
pub fn record_membership_event(kind: &str) {
    counter!("stripe_membership_events_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_framing_error(peer_id: &str) {
    counter!("stripe_framing_errors_total", "peer_id" => peer_id.to_string()).increment(1);
}

pub fn record_send_failure(peer_id: &str) {
    counter!("stripe_send_failures_total", "peer_id" => peer_id.to_string()).increment(1);
}

pub fn set_reachable_peers(count: usize) {
    gauge!("stripe_reachable_peers").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════════
// State store
// ═══════════════════════════════════════════════════════════════════════════════

pub fn record_state_store_write(key: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("stripe_state_store_writes_total", "key" => key.to_string(), "status" => status).increment(1);
}

/// Increment the state store retry counter (SQLITE_BUSY).
pub fn state_store_retries_total(operation: &str) {
    counter!("stripe_state_store_retries_total", "operation" => operation.to_string()).increment(1);
}
