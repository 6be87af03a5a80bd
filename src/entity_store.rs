// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity storage integration.
//!
//! The coordinator never interprets entity payloads. It needs a store that
//! can list entities, hand out a per-key ordered snapshot for passive sync,
//! append client invocations with a fresh version, and apply replicated
//! units idempotently.
//!
//! # Idempotence
//!
//! `apply` compares the unit's version with the highest version already
//! applied for its `(entity, key)`. Anything at or below it is reported as
//! [`ApplyOutcome::Duplicate`] and changes nothing, so replays after a
//! resync are harmless.
//!
//! # Example
//!
//! ```rust,no_run
//! use stripe_coordinator::entity_store::{ApplyOutcome, MemoryEntityStore, ReplicatedStore};
//! use stripe_coordinator::types::{ConcurrencyKey, EntityId};
//!
//! # async fn example() -> stripe_coordinator::Result<()> {
//! let store = MemoryEntityStore::new();
//! let entity = EntityId::new("Cache", "sessions");
//! let unit = store.append(&entity, ConcurrencyKey(0), b"put a=1".to_vec()).await?;
//! assert_eq!(store.apply(unit).await?, ApplyOutcome::Duplicate);
//! # Ok(())
//! # }
//! ```

use crate::error::BoxFuture;
use crate::types::{ConcurrencyKey, EntityId, EntitySyncUnit};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Duplicate => "duplicate",
        }
    }
}

/// What the coordinator needs from the entity storage layer.
pub trait ReplicatedStore: Send + Sync + 'static {
    /// Apply a replicated unit unless its version was already applied.
    fn apply(&self, unit: EntitySyncUnit) -> BoxFuture<'_, ApplyOutcome>;

    fn applied_version<'a>(&'a self, entity: &'a EntityId, key: ConcurrencyKey) -> BoxFuture<'a, Option<u64>>;

    fn entities(&self) -> BoxFuture<'_, Vec<EntityId>>;

    /// Every unit of `entity`, ordered by key then version.
    fn snapshot<'a>(&'a self, entity: &'a EntityId) -> BoxFuture<'a, Vec<EntitySyncUnit>>;

    /// Record a client invocation locally under the next version for its key.
    fn append<'a>(&'a self, entity: &'a EntityId, key: ConcurrencyKey, payload: Vec<u8>) -> BoxFuture<'a, EntitySyncUnit>;
}

#[derive(Default)]
struct MemoryState {
    units: BTreeMap<EntityId, BTreeMap<ConcurrencyKey, Vec<EntitySyncUnit>>>,
    /// Every applied or appended unit in the order it took effect.
    log: Vec<EntitySyncUnit>,
}

/// In-memory [`ReplicatedStore`].
#[derive(Default)]
pub struct MemoryEntityStore {
    state: RwLock<MemoryState>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Versions held for one key, in order.
    pub async fn versions(&self, entity: &EntityId, key: ConcurrencyKey) -> Vec<u64> {
        let state = self.state.read().await;
        state
            .units
            .get(entity)
            .and_then(|keys| keys.get(&key))
            .map(|units| units.iter().map(|u| u.version).collect())
            .unwrap_or_default()
    }

    /// Units in the order they took effect.
    pub async fn applied_log(&self) -> Vec<EntitySyncUnit> {
        self.state.read().await.log.clone()
    }

    pub async fn unit_count(&self) -> usize {
        self.state.read().await.log.len()
    }
}

impl ReplicatedStore for MemoryEntityStore {
    fn apply(&self, unit: EntitySyncUnit) -> BoxFuture<'_, ApplyOutcome> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let units = state
                .units
                .entry(unit.entity.clone())
                .or_default()
                .entry(unit.key)
                .or_default();
            if units.last().map_or(false, |last| unit.version <= last.version) {
                return Ok(ApplyOutcome::Duplicate);
            }
            units.push(unit.clone());
            state.log.push(unit);
            Ok(ApplyOutcome::Applied)
        })
    }

    fn applied_version<'a>(&'a self, entity: &'a EntityId, key: ConcurrencyKey) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .units
                .get(entity)
                .and_then(|keys| keys.get(&key))
                .and_then(|units| units.last())
                .map(|u| u.version))
        })
    }

    fn entities(&self) -> BoxFuture<'_, Vec<EntityId>> {
        Box::pin(async move { Ok(self.state.read().await.units.keys().cloned().collect()) })
    }

    fn snapshot<'a>(&'a self, entity: &'a EntityId) -> BoxFuture<'a, Vec<EntitySyncUnit>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .units
                .get(entity)
                .map(|keys| keys.values().flatten().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn append<'a>(&'a self, entity: &'a EntityId, key: ConcurrencyKey, payload: Vec<u8>) -> BoxFuture<'a, EntitySyncUnit> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let units = state.units.entry(entity.clone()).or_default().entry(key).or_default();
            let version = units.last().map_or(1, |last| last.version + 1);
            let unit = EntitySyncUnit::new(entity.clone(), key, version, payload);
            units.push(unit.clone());
            state.log.push(unit.clone());
            Ok(unit)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> EntityId {
        EntityId::new("Map", "orders")
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_versions() {
        let store = MemoryEntityStore::new();
        let a = store.append(&entity(), ConcurrencyKey(1), vec![1]).await.unwrap();
        let b = store.append(&entity(), ConcurrencyKey(1), vec![2]).await.unwrap();
        let c = store.append(&entity(), ConcurrencyKey(2), vec![3]).await.unwrap();
        assert_eq!((a.version, b.version, c.version), (1, 2, 1));
        assert_eq!(store.applied_version(&entity(), ConcurrencyKey(1)).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = MemoryEntityStore::new();
        let unit = EntitySyncUnit::new(entity(), ConcurrencyKey(0), 3, vec![9]);

        assert_eq!(store.apply(unit.clone()).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(store.apply(unit.clone()).await.unwrap(), ApplyOutcome::Duplicate);

        let older = EntitySyncUnit::new(entity(), ConcurrencyKey(0), 2, vec![8]);
        assert_eq!(store.apply(older).await.unwrap(), ApplyOutcome::Duplicate);

        assert_eq!(store.versions(&entity(), ConcurrencyKey(0)).await, vec![3]);
        assert_eq!(store.unit_count().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_orders_by_key_then_version() {
        let store = MemoryEntityStore::new();
        store.append(&entity(), ConcurrencyKey(2), vec![]).await.unwrap();
        store.append(&entity(), ConcurrencyKey(1), vec![]).await.unwrap();
        store.append(&entity(), ConcurrencyKey(2), vec![]).await.unwrap();

        let snapshot = store.snapshot(&entity()).await.unwrap();
        let order: Vec<(u32, u64)> = snapshot.iter().map(|u| (u.key.0, u.version)).collect();
        assert_eq!(order, vec![(1, 1), (2, 1), (2, 2)]);

        assert!(store.snapshot(&EntityId::new("Map", "none")).await.unwrap().is_empty());
        assert_eq!(store.entities().await.unwrap(), vec![entity()]);
    }
}
