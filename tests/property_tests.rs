//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use bytes::BytesMut;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use stripe_coordinator::entity_store::{ApplyOutcome, MemoryEntityStore, ReplicatedStore};
use stripe_coordinator::state_store::MemoryStateBackend;
use stripe_coordinator::sync_applier::SyncApplier;
use stripe_coordinator::transport::memory::MemoryNetwork;
use stripe_coordinator::wire::{FrameDecoder, FrameEncoder, MessageType, HEADER_LENGTH};
use stripe_coordinator::{
    ClusterStateStore, ConcurrencyKey, ConsistencyManager, EntityId, EntitySyncUnit, FailoverPolicy, NodeId, Role,
    RoleStateMachine, StripeId, VoteTally,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn entity() -> EntityId {
    EntityId::new("Map", "orders")
}

/// Units for `counts[k]` versions of key `k`, interleaved by `order`.
fn interleaved_units(counts: &[u8], order: &[usize]) -> Vec<EntitySyncUnit> {
    let mut next: Vec<u64> = vec![1; counts.len()];
    let mut remaining: Vec<u8> = counts.to_vec();
    let mut units = Vec::new();
    let mut pick = order.iter().cycle();
    while remaining.iter().any(|r| *r > 0) {
        let start = pick.next().copied().unwrap_or(0) % counts.len();
        let key = (0..counts.len())
            .map(|i| (start + i) % counts.len())
            .find(|k| remaining[*k] > 0)
            .unwrap();
        units.push(EntitySyncUnit::new(entity(), ConcurrencyKey(key as u32), next[key], vec![key as u8]));
        next[key] += 1;
        remaining[key] -= 1;
    }
    units
}

// =============================================================================
// Frame Decoding Properties
// =============================================================================

proptest! {
    /// Arbitrary bytes never panic the decoder, and anything it accepts is
    /// a well-formed frame.
    #[test]
    fn frame_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::from(&data[..]);
        while let Ok(Some(frame)) = decoder.decode(&mut buf) {
            prop_assert!(frame.header.total_length as usize >= HEADER_LENGTH);
            prop_assert_eq!(frame.payload.len(), frame.header.payload_length());
        }
    }

    /// A valid header followed by noise: either a frame or an error, never
    /// a frame larger than the limit.
    #[test]
    fn frame_decode_respects_size_limit(
        payload in prop::collection::vec(any::<u8>(), 0..2048),
        limit in HEADER_LENGTH..1024usize,
    ) {
        let bytes = FrameEncoder::new().encode(MessageType::Heartbeat, 0, &payload).unwrap();
        let mut decoder = FrameDecoder::new(limit);
        let mut buf = BytesMut::from(&bytes[..]);
        match decoder.decode(&mut buf) {
            Ok(Some(frame)) => prop_assert!(frame.header.total_length as usize <= limit),
            Ok(None) => prop_assert!(false, "a whole frame was buffered"),
            Err(_) => prop_assert!(HEADER_LENGTH + payload.len() > limit),
        }
    }

    /// Frames survive arbitrary chunking of the byte stream, in order.
    #[test]
    fn frame_stream_reassembles_across_chunks(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
        chunk in 1usize..40,
    ) {
        let mut encoder = FrameEncoder::new();
        let mut stream = Vec::new();
        for payload in &payloads {
            stream.extend_from_slice(&encoder.encode(MessageType::Heartbeat, 0, payload).unwrap());
        }

        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for piece in stream.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }

        prop_assert!(buf.is_empty());
        prop_assert_eq!(decoded.len(), payloads.len());
        for (i, (frame, payload)) in decoded.iter().zip(&payloads).enumerate() {
            prop_assert_eq!(frame.header.sequence, i as u64);
            prop_assert_eq!(&frame.payload[..], &payload[..]);
        }
    }
}

// =============================================================================
// Quorum Properties
// =============================================================================

proptest! {
    /// Consistency promotes exactly when enough configured voters granted.
    #[test]
    fn quorum_counts_only_configured_voters(
        voter_count in 1usize..6,
        needed in 1usize..6,
        grants in prop::collection::btree_set(0usize..8, 0..8),
    ) {
        prop_assume!(needed <= voter_count);
        let voters: BTreeSet<NodeId> = (1..=voter_count).map(|i| NodeId::new(format!("v{}", i))).collect();
        let manager = ConsistencyManager::new(
            NodeId::new("self"),
            FailoverPolicy::Consistency { voters: needed },
            voters.clone(),
        );

        let granted: Vec<NodeId> = grants.iter().map(|i| NodeId::new(format!("v{}", i))).collect();
        let counted = granted.iter().filter(|g| voters.contains(*g)).count();
        let tally = VoteTally::from_votes(granted);

        prop_assert_eq!(manager.quorum_met(&tally), counted >= needed);
        prop_assert!(manager.quorum_met(&VoteTally::sole_survivor()));
    }

    /// Availability never consults the tally.
    #[test]
    fn availability_always_meets_quorum(grants in prop::collection::btree_set(0usize..4, 0..4)) {
        let manager = ConsistencyManager::new(NodeId::new("self"), FailoverPolicy::Availability, BTreeSet::new());
        let tally = VoteTally::from_votes(grants.into_iter().map(|i| NodeId::new(format!("n{}", i))));
        prop_assert!(manager.quorum_met(&tally));
    }
}

// =============================================================================
// Role Transition Properties
// =============================================================================

proptest! {
    /// Any sequence of proposals only ever walks legal edges, and the
    /// persisted role always matches the last committed non-STOPPED role.
    #[test]
    fn role_transitions_follow_graph(targets in prop::collection::vec(0usize..Role::ALL.len(), 1..24)) {
        runtime().block_on(async {
            let network = MemoryNetwork::new();
            let endpoint = network.join("a");
            let store = ClusterStateStore::with_backend(Arc::new(MemoryStateBackend::new())).await.unwrap();
            let gate = Arc::new(ConsistencyManager::new(NodeId::new("a"), FailoverPolicy::Availability, BTreeSet::new()));
            let machine = RoleStateMachine::new(
                NodeId::new("a"),
                StripeId::new("s"),
                gate,
                Arc::new(store.clone()),
                endpoint.transport.clone(),
            );

            let mut last_committed: Option<Role> = None;
            for index in targets {
                let to = Role::ALL[index];
                let from = machine.current();
                let result = machine.transition(to, &VoteTally::none()).await;
                let now = machine.current();

                if from == to {
                    prop_assert_eq!(now, from);
                } else if from == Role::Stopped {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(now, Role::Stopped);
                } else if from.can_transition_to(to) {
                    prop_assert!(result.is_ok());
                    prop_assert_eq!(now, to);
                    if to != Role::Stopped {
                        last_committed = Some(to);
                    }
                } else {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(now, from);
                }
                prop_assert_eq!(store.current_role().await.unwrap(), last_committed);
            }
            Ok(())
        })?;
    }

    /// ACTIVE is only ever entered from UNINITIALIZED or PASSIVE.
    #[test]
    fn active_only_from_uninitialized_or_passive(from in 0usize..Role::ALL.len()) {
        let from = Role::ALL[from];
        prop_assert_eq!(
            from.can_transition_to(Role::Active),
            matches!(from, Role::Uninitialized | Role::Passive)
        );
    }
}

// =============================================================================
// Replay and Ordering Properties
// =============================================================================

proptest! {
    /// Replaying any already-applied units changes nothing.
    #[test]
    fn replay_is_idempotent(
        counts in prop::collection::vec(1u8..6, 1..4),
        order in prop::collection::vec(0usize..4, 1..16),
        replay in prop::collection::vec(any::<prop::sample::Index>(), 0..20),
    ) {
        let units = interleaved_units(&counts, &order);
        runtime().block_on(async {
            let store = MemoryEntityStore::new();
            for unit in &units {
                prop_assert_eq!(store.apply(unit.clone()).await.unwrap(), ApplyOutcome::Applied);
            }
            let before = store.applied_log().await;

            for index in replay {
                let unit = index.get(&units).clone();
                prop_assert_eq!(store.apply(unit).await.unwrap(), ApplyOutcome::Duplicate);
            }
            prop_assert_eq!(store.applied_log().await, before);
            Ok(())
        })?;
    }

    /// Whatever the interleaving across keys, a sync session commits every
    /// key's versions in order, and invokes queued mid-session land after.
    #[test]
    fn sync_session_preserves_per_key_order(
        counts in prop::collection::vec(1u8..6, 1..4),
        order in prop::collection::vec(0usize..4, 1..16),
    ) {
        let units = interleaved_units(&counts, &order);
        runtime().block_on(async {
            let store = Arc::new(MemoryEntityStore::new());
            let applier = SyncApplier::new(NodeId::new("p"), store.clone());

            applier.on_sync_begin(1, 1).await;
            applier.on_entity_begin(1, entity(), units.len() as u32).await;
            for unit in &units {
                prop_assert!(applier.on_unit(1, unit.clone()).await.unwrap().is_some());
            }
            // A live invoke during the session is queued, not applied
            let next = u64::from(counts[0]) + 1;
            let invoke = EntitySyncUnit::new(entity(), ConcurrencyKey(0), next, vec![0xff]);
            applier.on_invoke(invoke).await.unwrap();
            prop_assert_eq!(store.unit_count().await, 0);

            applier.on_entity_end(1, entity()).await.unwrap();
            applier.on_sync_complete(1).await.unwrap();

            let mut seen: BTreeMap<ConcurrencyKey, Vec<u64>> = BTreeMap::new();
            for unit in store.applied_log().await {
                seen.entry(unit.key).or_default().push(unit.version);
            }
            for (key, count) in counts.iter().enumerate() {
                let extra = if key == 0 { 1 } else { 0 };
                let expected: Vec<u64> = (1..=u64::from(*count) + extra).collect();
                prop_assert_eq!(seen.get(&ConcurrencyKey(key as u32)), Some(&expected));
            }
            Ok(())
        })?;
    }
}
