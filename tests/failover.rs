// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failover tests over the in-process harness.
//!
//! # Running Tests
//! ```bash
//! cargo test --test failover
//! RUST_LOG=stripe_coordinator=debug cargo test --test failover -- --nocapture
//! ```
//!
//! # Test Organization
//! - `consistency_*` - quorum-gated promotion and operator override
//! - `availability_*` - unconditional promotion and split-brain resolution
//! - `graceful_*` - promotion after an announced departure

mod common;

use common::{eventually, id, started_stripe, SETTLE};
use std::collections::BTreeSet;
use stripe_coordinator::{FailoverPolicy, Role};

// =============================================================================
// Consistency Tests
// =============================================================================

#[tokio::test]
async fn consistency_crash_of_active_promotes_exactly_one() {
    let mut cluster = started_stripe(&["a", "b", "c"], FailoverPolicy::Consistency { voters: 1 }).await;
    cluster.wait_for_passive(SETTLE).await.unwrap();
    let first = cluster.wait_for_active(SETTLE).await.unwrap();

    cluster.crash_server(&first).await.unwrap();

    let next = cluster.wait_for_active(SETTLE).await.unwrap();
    assert_ne!(next, first);
    cluster.wait_for_passive(SETTLE).await.unwrap();

    let roles = cluster.roles();
    assert_eq!(roles.len(), 2);
    assert_eq!(roles.values().filter(|r| **r == Role::Active).count(), 1);
    assert_eq!(roles.values().filter(|r| **r == Role::Passive).count(), 1);

    // The survivor now follows the new active
    let follower = roles.keys().find(|n| **n != next).unwrap();
    assert_eq!(cluster.node(follower).unwrap().known_active(), Some(next.clone()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn consistency_lone_passive_stays_blocked_until_override() {
    let mut cluster = started_stripe(&["a", "b"], FailoverPolicy::Consistency { voters: 1 }).await;
    cluster.wait_for_passive(SETTLE).await.unwrap();
    let active = cluster.wait_for_active(SETTLE).await.unwrap();
    let survivor = cluster.server_names().into_iter().find(|n| *n != active).unwrap();

    cluster.crash_server(&active).await.unwrap();

    let blocked = eventually(SETTLE, || {
        let blocked = cluster.node(&survivor).unwrap().consistency_control().is_blocked();
        async move { blocked }
    })
    .await;
    assert!(blocked, "promotion should be suspended without a voter");

    let node = cluster.node(&survivor).unwrap();
    let control = node.consistency_control();
    assert_eq!(node.role(), Role::Passive);
    assert!(control.is_stuck(), "no voter is reachable");

    let requested = control.requested_actions();
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].requester, survivor);
    assert_eq!(requested[0].to, Role::Active);

    let released = control.allow_transition().expect("a suspended transition");
    assert_eq!(released.requester, survivor);

    node.wait_for_role(Role::Active, SETTLE).await.unwrap();
    assert!(!control.is_blocked());
    assert!(control.requested_actions().is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn consistency_allow_transition_with_nothing_suspended_is_noop() {
    let mut cluster = started_stripe(&["a", "b"], FailoverPolicy::Consistency { voters: 1 }).await;
    cluster.wait_for_passive(SETTLE).await.unwrap();

    for name in cluster.server_names() {
        let control = cluster.node(&name).unwrap().consistency_control();
        assert!(!control.is_blocked());
        assert!(control.allow_transition().is_none());
    }
    cluster.wait_for_active(SETTLE).await.unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn consistency_restarted_active_rejoins_stripe() {
    let mut cluster = started_stripe(&["a", "b", "c"], FailoverPolicy::Consistency { voters: 1 }).await;
    cluster.wait_for_passive(SETTLE).await.unwrap();

    let victim = cluster.restart_active(SETTLE).await.unwrap();

    cluster.wait_for_active(SETTLE).await.unwrap();
    cluster.wait_for_passive(SETTLE).await.unwrap();
    assert!(cluster.is_running(&victim));

    let roles: Vec<Role> = cluster.roles().into_values().collect();
    assert_eq!(roles.iter().filter(|r| **r == Role::Active).count(), 1);
    assert_eq!(roles.iter().filter(|r| **r == Role::Passive).count(), 2);

    cluster.shutdown().await;
}

// =============================================================================
// Graceful Departure Tests
// =============================================================================

#[tokio::test]
async fn graceful_stop_of_active_leaves_sole_survivor_active() {
    let mut cluster = started_stripe(&["a", "b"], FailoverPolicy::Consistency { voters: 1 }).await;
    cluster.wait_for_passive(SETTLE).await.unwrap();
    let active = cluster.wait_for_active(SETTLE).await.unwrap();
    let survivor = cluster.server_names().into_iter().find(|n| *n != active).unwrap();

    cluster.stop_server(&active).await.unwrap();

    // Every peer left gracefully, so no vote is needed
    let node = cluster.node(&survivor).unwrap();
    node.wait_for_role(Role::Active, SETTLE).await.unwrap();
    assert!(node.consistency_control().requested_actions().is_empty());

    cluster.shutdown().await;
}

// =============================================================================
// Availability Tests
// =============================================================================

#[tokio::test]
async fn availability_crash_of_active_promotes_passive() {
    let mut cluster = started_stripe(&["a", "b"], FailoverPolicy::Availability).await;
    cluster.wait_for_passive(SETTLE).await.unwrap();
    let active = cluster.wait_for_active(SETTLE).await.unwrap();

    cluster.crash_server(&active).await.unwrap();

    let next = cluster.wait_for_active(SETTLE).await.unwrap();
    assert_ne!(next, active);
    let control = cluster.node(&next).unwrap().consistency_control();
    assert!(!control.is_blocked());

    cluster.shutdown().await;
}

#[tokio::test]
async fn availability_split_brain_resolves_on_heal() {
    let mut cluster = started_stripe(&["a", "b"], FailoverPolicy::Availability).await;
    cluster.wait_for_passive(SETTLE).await.unwrap();
    assert_eq!(cluster.wait_for_active(SETTLE).await.unwrap(), id("a"));

    cluster.partition(&id("a"), &id("b"));

    // Both sides of the cut believe they are the active
    let both_active = eventually(SETTLE, || {
        let roles = cluster.roles();
        async move { roles.values().all(|r| *r == Role::Active) }
    })
    .await;
    assert!(both_active, "b should promote while cut off: {:?}", cluster.roles());

    cluster.heal(&id("a"), &id("b"));

    let resolved = eventually(SETTLE, || {
        let roles = cluster.roles();
        async move { roles.get(&id("a")) == Some(&Role::Active) && roles.get(&id("b")) == Some(&Role::Stopped) }
    })
    .await;
    assert!(resolved, "higher id should zap itself: {:?}", cluster.roles());
    assert_eq!(cluster.actives().unwrap(), vec![id("a")]);

    // A zapped server did not shut down cleanly
    let zapped = cluster.node(&id("b")).unwrap();
    assert!(!zapped.state_store().is_clean_shutdown().await.unwrap());

    cluster.shutdown().await;
}

#[tokio::test]
async fn availability_partitioned_passive_does_not_disturb_active() {
    let mut cluster = started_stripe(&["a", "b", "c"], FailoverPolicy::Availability).await;
    cluster.wait_for_passive(SETTLE).await.unwrap();
    let active = cluster.wait_for_active(SETTLE).await.unwrap();
    let names: BTreeSet<_> = cluster.server_names().into_iter().collect();
    let passive = names.iter().find(|n| **n != active).unwrap().clone();

    for other in names.iter().filter(|n| **n != passive) {
        cluster.partition(&passive, other);
    }
    cluster.node(&passive).unwrap().wait_for_role(Role::Active, SETTLE).await.unwrap();
    assert_eq!(cluster.observed_role(&active), Some(Role::Active));

    for other in names.iter().filter(|n| **n != passive) {
        cluster.heal(&passive, other);
    }

    let settled = eventually(SETTLE, || {
        let actives = cluster.actives();
        async move { matches!(actives, Ok(ref a) if a.len() == 1) }
    })
    .await;
    assert!(settled, "one active after heal: {:?}", cluster.roles());

    cluster.shutdown().await;
}
