//! Recording ReplicatedStore for testing.
//!
//! Wraps a MemoryEntityStore and records every apply() with its outcome,
//! so tests can assert order and idempotence as the passive saw them.

use std::sync::Mutex;
use stripe_coordinator::entity_store::{ApplyOutcome, MemoryEntityStore, ReplicatedStore};
use stripe_coordinator::{BoxFuture, ConcurrencyKey, EntityId, EntitySyncUnit};

/// A recorded apply() call.
#[derive(Debug, Clone)]
pub struct ApplyCall {
    pub entity: EntityId,
    pub key: ConcurrencyKey,
    pub version: u64,
    pub outcome: ApplyOutcome,
}

#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryEntityStore,
    applies: Mutex<Vec<ApplyCall>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryEntityStore {
        &self.inner
    }

    pub fn applies(&self) -> Vec<ApplyCall> {
        self.applies.lock().unwrap().clone()
    }

    /// Versions applied (not duplicates) for one key, in apply order.
    pub fn applied_versions(&self, entity: &EntityId, key: ConcurrencyKey) -> Vec<u64> {
        self.applies()
            .into_iter()
            .filter(|c| &c.entity == entity && c.key == key && c.outcome == ApplyOutcome::Applied)
            .map(|c| c.version)
            .collect()
    }

    pub fn duplicate_count(&self) -> usize {
        self.applies()
            .iter()
            .filter(|c| c.outcome == ApplyOutcome::Duplicate)
            .count()
    }
}

impl ReplicatedStore for RecordingStore {
    fn apply(&self, unit: EntitySyncUnit) -> BoxFuture<'_, ApplyOutcome> {
        Box::pin(async move {
            let (entity, key, version) = (unit.entity.clone(), unit.key, unit.version);
            let outcome = self.inner.apply(unit).await?;
            self.applies.lock().unwrap().push(ApplyCall {
                entity,
                key,
                version,
                outcome,
            });
            Ok(outcome)
        })
    }

    fn applied_version<'a>(&'a self, entity: &'a EntityId, key: ConcurrencyKey) -> BoxFuture<'a, Option<u64>> {
        self.inner.applied_version(entity, key)
    }

    fn entities(&self) -> BoxFuture<'_, Vec<EntityId>> {
        self.inner.entities()
    }

    fn snapshot<'a>(&'a self, entity: &'a EntityId) -> BoxFuture<'a, Vec<EntitySyncUnit>> {
        self.inner.snapshot(entity)
    }

    fn append<'a>(&'a self, entity: &'a EntityId, key: ConcurrencyKey, payload: Vec<u8>) -> BoxFuture<'a, EntitySyncUnit> {
        self.inner.append(entity, key, payload)
    }
}
