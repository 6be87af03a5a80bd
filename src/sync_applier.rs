// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Receiving side of passive sync.
//!
//! Units of a session are staged per entity and only handed to the
//! [`ReplicatedStore`] when the active closes that entity with
//! `SyncEntityEnd`. A session that dies half way therefore leaves whole
//! entities applied or untouched, never a prefix of one.
//!
//! Invocations that arrive while a session is open are queued and applied
//! after the last entity commits. Applying them earlier would raise the
//! per-key version watermark and turn the older synced units into
//! duplicates.

use crate::entity_store::{ApplyOutcome, ReplicatedStore};
use crate::error::{CoordinatorError, Result};
use crate::metrics;
use crate::protocol::AckRef;
use crate::types::{ConcurrencyKey, EntityId, EntitySyncUnit, NodeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Upper bound on staging space reserved from an announced unit count.
const MAX_STAGED_PREALLOC: u32 = 1024;

struct StagedEntity {
    announced: u32,
    units: Vec<EntitySyncUnit>,
    last_version: HashMap<ConcurrencyKey, u64>,
}

#[derive(Default)]
struct ApplierState {
    session: Option<u64>,
    staged: HashMap<EntityId, StagedEntity>,
    queued_invokes: Vec<EntitySyncUnit>,
}

impl ApplierState {
    fn staged_units(&self) -> usize {
        self.staged.values().map(|e| e.units.len()).sum::<usize>() + self.queued_invokes.len()
    }
}

/// Stages and commits sync traffic from the active.
pub struct SyncApplier {
    node_id: NodeId,
    store: Arc<dyn ReplicatedStore>,
    state: Mutex<ApplierState>,
}

impl SyncApplier {
    pub fn new(node_id: NodeId, store: Arc<dyn ReplicatedStore>) -> Self {
        Self {
            node_id,
            store,
            state: Mutex::new(ApplierState::default()),
        }
    }

    pub async fn in_session(&self) -> bool {
        self.state.lock().await.session.is_some()
    }

    /// A new session replaces whatever an earlier one left staged.
    pub async fn on_sync_begin(&self, session: u64, entities: u32) -> AckRef {
        let mut state = self.state.lock().await;
        let leftover = state.staged_units();
        if leftover > 0 {
            metrics::record_sync_staging_discarded(leftover);
        }
        *state = ApplierState {
            session: Some(session),
            ..Default::default()
        };
        info!(node_id = %self.node_id, session, entities, "Sync session started");
        AckRef::SyncBegin { session }
    }

    pub async fn on_entity_begin(&self, session: u64, entity: EntityId, units: u32) {
        let mut state = self.state.lock().await;
        if state.session != Some(session) {
            debug!(node_id = %self.node_id, session, "Entity begin for unknown session ignored");
            return;
        }
        state.staged.insert(
            entity,
            StagedEntity {
                announced: units,
                units: Vec::with_capacity(units.min(MAX_STAGED_PREALLOC) as usize),
                last_version: HashMap::new(),
            },
        );
    }

    /// Stage one unit. `Ok(None)` means the unit belongs to a session that
    /// is no longer current and is dropped without an ack.
    pub async fn on_unit(&self, session: u64, unit: EntitySyncUnit) -> Result<Option<AckRef>> {
        let mut state = self.state.lock().await;
        if state.session != Some(session) {
            return Ok(None);
        }
        let staged = state.staged.get_mut(&unit.entity).ok_or_else(|| {
            CoordinatorError::Internal(format!("unit for {} arrived before its entity begin", unit.entity))
        })?;

        if let Some(&last) = staged.last_version.get(&unit.key) {
            if unit.version <= last {
                warn!(
                    node_id = %self.node_id,
                    entity = %unit.entity,
                    key = %unit.key,
                    version = unit.version,
                    last,
                    "Out of order sync unit rejected"
                );
                return Err(CoordinatorError::Internal(format!(
                    "sync unit {}/{}@{} not after {}",
                    unit.entity, unit.key, unit.version, last
                )));
            }
        }
        staged.last_version.insert(unit.key, unit.version);

        let ack = AckRef::Unit {
            session,
            entity: unit.entity.clone(),
            key: unit.key,
            version: unit.version,
        };
        staged.units.push(unit);
        Ok(Some(ack))
    }

    /// Commit every staged unit of `entity` to the store.
    pub async fn on_entity_end(&self, session: u64, entity: EntityId) -> Result<Option<AckRef>> {
        let staged = {
            let mut state = self.state.lock().await;
            if state.session != Some(session) {
                return Ok(None);
            }
            match state.staged.remove(&entity) {
                Some(staged) => staged,
                None => {
                    return Err(CoordinatorError::Internal(format!(
                        "entity end for {} without a matching begin",
                        entity
                    )))
                }
            }
        };

        if staged.units.len() != staged.announced as usize {
            warn!(
                node_id = %self.node_id,
                entity = %entity,
                announced = staged.announced,
                received = staged.units.len(),
                "Entity unit count differs from its announcement"
            );
        }

        let (applied, duplicate) = self.apply_all(staged.units).await?;
        debug!(node_id = %self.node_id, entity = %entity, applied, duplicate, "Entity committed");
        Ok(Some(AckRef::EntityEnd { session, entity }))
    }

    /// Close the session and drain queued invocations.
    pub async fn on_sync_complete(&self, session: u64) -> Result<Option<AckRef>> {
        let queued = {
            let mut state = self.state.lock().await;
            if state.session != Some(session) {
                return Ok(None);
            }
            let unfinished: usize = state.staged.values().map(|e| e.units.len()).sum();
            if unfinished > 0 {
                warn!(node_id = %self.node_id, session, unfinished, "Sync completed with unfinished entities");
                metrics::record_sync_staging_discarded(unfinished);
            }
            state.session = None;
            state.staged.clear();
            std::mem::take(&mut state.queued_invokes)
        };

        let (applied, duplicate) = self.apply_all(queued).await?;
        info!(node_id = %self.node_id, session, applied, duplicate, "Sync session complete");
        Ok(Some(AckRef::SyncComplete { session }))
    }

    /// Apply (or queue, mid-session) a unit replicated from a client call.
    pub async fn on_invoke(&self, unit: EntitySyncUnit) -> Result<AckRef> {
        let ack = AckRef::Invoke {
            entity: unit.entity.clone(),
            key: unit.key,
            version: unit.version,
        };
        {
            let mut state = self.state.lock().await;
            if state.session.is_some() {
                state.queued_invokes.push(unit);
                return Ok(ack);
            }
        }
        let outcome = self.store.apply(unit).await?;
        metrics::record_sync_units_applied(outcome.as_str(), 1);
        Ok(ack)
    }

    /// Drop all staged state. Returns how many units were thrown away.
    pub async fn discard(&self) -> usize {
        let mut state = self.state.lock().await;
        let dropped = state.staged_units();
        let session = state.session;
        *state = ApplierState::default();
        if dropped > 0 || session.is_some() {
            metrics::record_sync_staging_discarded(dropped);
            info!(node_id = %self.node_id, session = ?session, dropped, "Discarded partial sync state");
        }
        dropped
    }

    async fn apply_all(&self, units: Vec<EntitySyncUnit>) -> Result<(usize, usize)> {
        let mut applied = 0;
        let mut duplicate = 0;
        for unit in units {
            match self.store.apply(unit).await? {
                ApplyOutcome::Applied => applied += 1,
                ApplyOutcome::Duplicate => duplicate += 1,
            }
        }
        metrics::record_sync_units_applied(ApplyOutcome::Applied.as_str(), applied);
        metrics::record_sync_units_applied(ApplyOutcome::Duplicate.as_str(), duplicate);
        Ok((applied, duplicate))
    }
}
