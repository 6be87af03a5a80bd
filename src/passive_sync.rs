//! Active-side passive sync.
//!
//! Streams entity state to passives and keeps them current afterwards.
//!
//! # Session flow
//!
//! ```text
//! SyncBegin ──ack──► per entity:
//!                      SyncEntityBegin
//!                      per key (bounded, in parallel):
//!                        SyncEntity v1 ──ack──► SyncEntity v2 ──ack──► ...
//!                      SyncEntityEnd ──ack──► watermark advanced
//!                    SyncComplete ──ack──► target is PASSIVE
//! ```
//!
//! Units of one concurrency key are never in flight together: the next is
//! sent only after the previous one is acked. Keys of an entity proceed in
//! parallel up to `max_concurrent_keys`.
//!
//! # Failure handling
//!
//! - Target lost: pending acks fail, per-target watermarks are cleared and
//!   the session waits up to `resync_deadline` for the target to announce
//!   PASSIVE_UNINITIALIZED again, then restarts with every entity.
//! - Ack timeout with the target still connected: the session is retried
//!   from the start up to `max_attempts` times.
//! - Otherwise the request fails and its waiter is told why.

use crate::config::SyncConfig;
use crate::entity_store::ReplicatedStore;
use crate::error::{CoordinatorError, Result};
use crate::metrics;
use crate::protocol::{AckRef, GroupMessage};
use crate::resilience::{Bulkhead, RateLimiter};
use crate::transport::GroupTransport;
use crate::types::{ConcurrencyKey, EntityId, EntitySyncUnit, NodeId, Role};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Ack registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Outstanding acknowledgements, keyed by the peer expected to send them.
#[derive(Default)]
pub struct AckRegistry {
    pending: Mutex<HashMap<(NodeId, AckRef), oneshot::Sender<()>>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, from: NodeId, ack: AckRef) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.insert((from, ack), tx);
        rx
    }

    /// Returns `false` for an ack nobody is waiting on.
    pub fn resolve(&self, from: &NodeId, ack: &AckRef) -> bool {
        let tx = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.remove(&(from.clone(), ack.clone()))
        };
        match tx {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, from: &NodeId, ack: &AckRef) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.remove(&(from.clone(), ack.clone()));
    }

    /// Drop every waiter on `from`. Their receivers see the sender vanish.
    pub fn fail_peer(&self, from: &NodeId) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let before = pending.len();
        pending.retain(|(peer, _), _| peer != from);
        before - pending.len()
    }

    pub fn fail_all(&self) {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sync requests
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Completed,
    Failed(String),
}

/// Handle on one sync request. Its status changes exactly once.
#[derive(Debug)]
pub struct SyncRequest {
    target: NodeId,
    status: watch::Receiver<SyncStatus>,
}

impl SyncRequest {
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Wait until the request completes or is abandoned.
    ///
    /// Returns [`CoordinatorError::Shutdown`] if the engine went away first.
    pub async fn wait_for(mut self) -> Result<()> {
        loop {
            let status = self.status.borrow_and_update().clone();
            match status {
                SyncStatus::Completed => return Ok(()),
                SyncStatus::Failed(reason) => {
                    return Err(CoordinatorError::SyncFailed {
                        target: self.target.to_string(),
                        reason,
                    })
                }
                SyncStatus::Pending => {}
            }
            if self.status.changed().await.is_err() {
                let last = self.status.borrow().clone();
                return match last {
                    SyncStatus::Completed => Ok(()),
                    SyncStatus::Failed(reason) => Err(CoordinatorError::SyncFailed {
                        target: self.target.to_string(),
                        reason,
                    }),
                    SyncStatus::Pending => Err(CoordinatorError::Shutdown),
                };
            }
        }
    }
}

#[derive(Debug, Clone)]
enum SyncScope {
    All,
    Entities(Vec<EntityId>),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

type Watermarks = HashMap<(EntityId, ConcurrencyKey), u64>;

/// Drives passive sync and invoke replication from the active.
pub struct PassiveSyncEngine {
    node_id: NodeId,
    config: SyncConfig,
    store: Arc<dyn ReplicatedStore>,
    transport: Arc<dyn GroupTransport>,
    acks: AckRegistry,
    bulkhead: Bulkhead,
    rate_limiter: Option<RateLimiter>,

    /// Passive-family peers and their last announced role.
    peer_roles: Mutex<HashMap<NodeId, Role>>,
    /// Targets whose current session has had its SyncBegin acked.
    in_session: Mutex<HashSet<NodeId>>,
    /// Running session tasks per target.
    running: Mutex<HashMap<NodeId, usize>>,
    /// Bumped every time a peer is lost.
    loss_epochs: Mutex<HashMap<NodeId, u64>>,
    /// Highest version per key each target is known to hold.
    watermarks: Mutex<HashMap<NodeId, Watermarks>>,
    target_locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,

    /// Rejoin announces, tagged with the peer's loss epoch when seen.
    rejoined: broadcast::Sender<(NodeId, u64)>,
    next_session: AtomicU64,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PassiveSyncEngine {
    pub fn new(
        node_id: NodeId,
        config: SyncConfig,
        store: Arc<dyn ReplicatedStore>,
        transport: Arc<dyn GroupTransport>,
    ) -> Arc<Self> {
        let (rejoined, _) = broadcast::channel(64);
        let rate_limiter = config.rate_limit_config().map(RateLimiter::new);
        // Session ids only need to differ from whatever a previous active used.
        let first_session = chrono::Utc::now().timestamp_micros().max(1) as u64;

        Arc::new(Self {
            node_id,
            bulkhead: Bulkhead::for_sync_keys(config.max_concurrent_keys),
            rate_limiter,
            config,
            store,
            transport,
            acks: AckRegistry::new(),
            peer_roles: Mutex::new(HashMap::new()),
            in_session: Mutex::new(HashSet::new()),
            running: Mutex::new(HashMap::new()),
            loss_epochs: Mutex::new(HashMap::new()),
            watermarks: Mutex::new(HashMap::new()),
            target_locks: Mutex::new(HashMap::new()),
            rejoined,
            next_session: AtomicU64::new(first_session),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sessions queued or running, across all targets.
    pub fn active_sessions(&self) -> usize {
        self.running.lock().unwrap_or_else(|p| p.into_inner()).values().sum()
    }

    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// Peers currently receiving invoke replication.
    pub fn replication_targets(&self) -> Vec<NodeId> {
        let mut targets: HashSet<NodeId> = self
            .peer_roles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(_, role)| **role == Role::Passive)
            .map(|(peer, _)| peer.clone())
            .collect();
        targets.extend(self.in_session.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned());
        let mut targets: Vec<NodeId> = targets.into_iter().collect();
        targets.sort();
        targets
    }

    /// Sync the named entities to `target`.
    ///
    /// Requests for the same target run one after another. Units the target
    /// already acknowledged in an earlier session are not resent.
    pub fn sync_entities(self: &Arc<Self>, target: NodeId, entities: Vec<EntityId>) -> SyncRequest {
        self.spawn_session(target, SyncScope::Entities(entities))
    }

    /// Sync every entity to `target`.
    pub fn sync_all(self: &Arc<Self>, target: NodeId) -> SyncRequest {
        self.spawn_session(target, SyncScope::All)
    }

    /// A peer announced its role.
    ///
    /// PASSIVE_UNINITIALIZED starts a full sync, or wakes a session that is
    /// waiting for that peer to come back.
    pub fn on_peer_role(self: &Arc<Self>, peer: &NodeId, role: Role) -> Option<SyncRequest> {
        {
            let mut roles = self.peer_roles.lock().unwrap_or_else(|p| p.into_inner());
            if role.is_passive_family() {
                roles.insert(peer.clone(), role);
            } else {
                roles.remove(peer);
            }
        }

        if !matches!(role, Role::PassiveUninitialized | Role::Syncing) {
            return None;
        }
        if self.running_for(peer) > 0 {
            let _ = self.rejoined.send((peer.clone(), self.loss_epoch(peer)));
            return None;
        }
        if role == Role::PassiveUninitialized {
            return Some(self.sync_all(peer.clone()));
        }
        None
    }

    /// A peer left or is suspected. Its acks fail and its progress is forgotten.
    pub fn on_peer_lost(&self, peer: &NodeId) {
        self.peer_roles.lock().unwrap_or_else(|p| p.into_inner()).remove(peer);
        self.in_session.lock().unwrap_or_else(|p| p.into_inner()).remove(peer);
        self.watermarks.lock().unwrap_or_else(|p| p.into_inner()).remove(peer);
        *self
            .loss_epochs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(peer.clone())
            .or_default() += 1;
        let failed = self.acks.fail_peer(peer);
        if failed > 0 {
            debug!(node_id = %self.node_id, peer = %peer, failed, "Failed pending acks for lost peer");
        }
    }

    pub fn on_ack(&self, from: &NodeId, ack: &AckRef) {
        if !self.acks.resolve(from, ack) {
            debug!(node_id = %self.node_id, from = %from, ack = %ack, "Unexpected ack ignored");
        }
    }

    /// Replicate a freshly applied client invocation to every passive.
    ///
    /// Returns how many passives acknowledged it. A passive that misses it
    /// is brought back by its next full sync.
    pub async fn replicate(&self, unit: EntitySyncUnit) -> Result<usize> {
        if self.is_closed() {
            return Err(CoordinatorError::Shutdown);
        }
        let targets = self.replication_targets();
        let ack = AckRef::Invoke {
            entity: unit.entity.clone(),
            key: unit.key,
            version: unit.version,
        };

        let sends = targets.iter().map(|target| {
            let message = GroupMessage::Invoke { unit: unit.clone() };
            let ack = ack.clone();
            async move {
                let epoch = self.loss_epoch(target);
                let result = self.send_acked(target, message, ack, epoch).await;
                (target, result)
            }
        });

        let mut acked = 0;
        for (target, result) in futures::future::join_all(sends).await {
            match result {
                Ok(()) => acked += 1,
                Err(e) => warn!(node_id = %self.node_id, target = %target, error = %e, "Invoke not acknowledged"),
            }
        }
        Ok(acked)
    }

    /// Stop all sessions. Waiters see [`CoordinatorError::Shutdown`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.acks.fail_all();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in &tasks {
            task.abort();
        }
        self.running.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.in_session.lock().unwrap_or_else(|p| p.into_inner()).clear();
        metrics::set_sync_sessions_active(0);
        info!(node_id = %self.node_id, aborted = tasks.len(), "Passive sync engine closed");
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Session task
    // ───────────────────────────────────────────────────────────────────────────

    fn spawn_session(self: &Arc<Self>, target: NodeId, scope: SyncScope) -> SyncRequest {
        let (status_tx, status_rx) = watch::channel(SyncStatus::Pending);
        let request = SyncRequest {
            target: target.clone(),
            status: status_rx,
        };
        if self.is_closed() {
            // Dropping the sender resolves the waiter with Shutdown.
            return request;
        }

        self.adjust_running(&target, 1);
        let rejoined = self.rejoined.subscribe();
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let lock = engine.target_lock(&target);
            let _serial = lock.lock().await;

            let result = engine.run_session(&target, scope, rejoined).await;
            engine.adjust_running(&target, -1);
            match result {
                Ok(()) => {
                    status_tx.send_replace(SyncStatus::Completed);
                }
                // Leave it pending; the dropped sender reads as shutdown.
                Err(CoordinatorError::Shutdown) => {}
                Err(CoordinatorError::SyncFailed { reason, .. }) => {
                    status_tx.send_replace(SyncStatus::Failed(reason));
                }
                Err(e) => {
                    status_tx.send_replace(SyncStatus::Failed(e.to_string()));
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
        request
    }

    async fn run_session(
        &self,
        target: &NodeId,
        mut scope: SyncScope,
        mut rejoined: broadcast::Receiver<(NodeId, u64)>,
    ) -> Result<()> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            if self.is_closed() {
                return Err(CoordinatorError::Shutdown);
            }
            attempt += 1;
            let entities = match &scope {
                SyncScope::All => self.store.entities().await?,
                SyncScope::Entities(entities) => entities.clone(),
            };
            let session = self.next_session.fetch_add(1, Ordering::Relaxed);
            info!(
                node_id = %self.node_id,
                target = %target,
                session,
                attempt,
                entities = entities.len(),
                "Starting passive sync"
            );

            let result = self.stream_session(target, session, &entities).await;
            if result.is_err() {
                self.in_session.lock().unwrap_or_else(|p| p.into_inner()).remove(target);
            }

            match result {
                Ok(()) => {
                    metrics::record_sync_session(target.as_str(), "completed", started.elapsed());
                    info!(
                        node_id = %self.node_id,
                        target = %target,
                        session,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Passive sync complete"
                    );
                    return Ok(());
                }
                Err(_) if self.is_closed() => return Err(CoordinatorError::Shutdown),
                Err(CoordinatorError::SyncInterrupted { message, .. }) => {
                    warn!(node_id = %self.node_id, target = %target, session, reason = %message, "Passive sync interrupted");
                    self.watermarks.lock().unwrap_or_else(|p| p.into_inner()).remove(target);
                    if !self.await_rejoin(target, &mut rejoined).await {
                        metrics::record_sync_session(target.as_str(), "abandoned", started.elapsed());
                        return Err(CoordinatorError::SyncFailed {
                            target: target.to_string(),
                            reason: format!(
                                "target did not rejoin within {:?}",
                                self.config.resync_deadline_duration()
                            ),
                        });
                    }
                    info!(node_id = %self.node_id, target = %target, "Sync target rejoined, resending in full");
                    scope = SyncScope::All;
                    attempt = 0;
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    warn!(node_id = %self.node_id, target = %target, session, attempt, error = %e, "Passive sync attempt failed, retrying");
                }
                Err(e) => {
                    metrics::record_sync_session(target.as_str(), "failed", started.elapsed());
                    warn!(node_id = %self.node_id, target = %target, session, error = %e, "Passive sync failed");
                    return Err(CoordinatorError::SyncFailed {
                        target: target.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn stream_session(&self, target: &NodeId, session: u64, entities: &[EntityId]) -> Result<()> {
        let epoch = self.loss_epoch(target);

        self.send_acked(
            target,
            GroupMessage::SyncBegin {
                session,
                entities: entities.len() as u32,
            },
            AckRef::SyncBegin { session },
            epoch,
        )
        .await?;
        self.in_session.lock().unwrap_or_else(|p| p.into_inner()).insert(target.clone());

        for entity in entities {
            self.sync_entity(target, session, entity, epoch).await?;
        }

        self.send_acked(
            target,
            GroupMessage::SyncComplete { session },
            AckRef::SyncComplete { session },
            epoch,
        )
        .await?;

        // The target commits PASSIVE before acking SyncComplete.
        self.peer_roles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(target.clone(), Role::Passive);
        self.in_session.lock().unwrap_or_else(|p| p.into_inner()).remove(target);
        Ok(())
    }

    async fn sync_entity(&self, target: &NodeId, session: u64, entity: &EntityId, epoch: u64) -> Result<()> {
        let snapshot = self.store.snapshot(entity).await?;
        let marks = self.watermarks_for(target, entity);

        let mut by_key: BTreeMap<ConcurrencyKey, Vec<EntitySyncUnit>> = BTreeMap::new();
        for unit in snapshot {
            if marks.get(&unit.key).map_or(true, |&mark| unit.version > mark) {
                by_key.entry(unit.key).or_default().push(unit);
            }
        }
        if by_key.is_empty() {
            debug!(node_id = %self.node_id, target = %target, entity = %entity, "Entity already replicated");
            return Ok(());
        }

        let units: usize = by_key.values().map(Vec::len).sum();
        let tops: Vec<(ConcurrencyKey, u64)> = by_key
            .iter()
            .filter_map(|(key, units)| units.last().map(|u| (*key, u.version)))
            .collect();

        self.transport
            .send(
                target,
                GroupMessage::SyncEntityBegin {
                    session,
                    entity: entity.clone(),
                    units: units as u32,
                },
            )
            .await
            .map_err(|e| interrupted(target, e))?;

        let keys = by_key
            .into_values()
            .map(|key_units| self.sync_key(target, session, key_units, epoch));
        futures::future::try_join_all(keys).await?;

        self.send_acked(
            target,
            GroupMessage::SyncEntityEnd {
                session,
                entity: entity.clone(),
            },
            AckRef::EntityEnd {
                session,
                entity: entity.clone(),
            },
            epoch,
        )
        .await?;

        let mut watermarks = self.watermarks.lock().unwrap_or_else(|p| p.into_inner());
        let target_marks = watermarks.entry(target.clone()).or_default();
        for (key, version) in tops {
            target_marks.insert((entity.clone(), key), version);
        }
        debug!(node_id = %self.node_id, target = %target, entity = %entity, units, "Entity synced");
        Ok(())
    }

    /// Send one key's units strictly one at a time.
    async fn sync_key(&self, target: &NodeId, session: u64, units: Vec<EntitySyncUnit>, epoch: u64) -> Result<()> {
        let _permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

        for unit in units {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }
            let ack = AckRef::Unit {
                session,
                entity: unit.entity.clone(),
                key: unit.key,
                version: unit.version,
            };
            self.send_acked(target, GroupMessage::SyncEntity { session, unit }, ack, epoch)
                .await?;
            metrics::record_sync_unit_sent(target.as_str());
        }
        Ok(())
    }

    async fn send_acked(&self, target: &NodeId, message: GroupMessage, ack: AckRef, epoch: u64) -> Result<()> {
        let rx = self.acks.register(target.clone(), ack.clone());
        if let Err(e) = self.transport.send(target, message).await {
            self.acks.cancel(target, &ack);
            return Err(interrupted(target, e));
        }

        match tokio::time::timeout(self.config.ack_timeout_duration(), rx).await {
            Ok(Ok(())) if self.loss_epoch(target) == epoch => Ok(()),
            Ok(Ok(())) => Err(interrupted(target, "target was lost during the session")),
            Ok(Err(_)) => Err(interrupted(target, format!("ack {} abandoned", ack))),
            Err(_) => {
                self.acks.cancel(target, &ack);
                Err(CoordinatorError::timeout(format!("ack {}", ack), target.as_str()))
            }
        }
    }

    async fn await_rejoin(&self, target: &NodeId, rejoined: &mut broadcast::Receiver<(NodeId, u64)>) -> bool {
        // Announces seen before the loss are stale.
        let lost_at = self.loss_epoch(target);
        let wait = async {
            loop {
                match rejoined.recv().await {
                    Ok((peer, epoch)) if &peer == target && epoch >= lost_at => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        tokio::time::timeout(self.config.resync_deadline_duration(), wait)
            .await
            .unwrap_or(false)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Bookkeeping
    // ───────────────────────────────────────────────────────────────────────────

    fn loss_epoch(&self, target: &NodeId) -> u64 {
        self.loss_epochs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    fn watermarks_for(&self, target: &NodeId, entity: &EntityId) -> HashMap<ConcurrencyKey, u64> {
        let watermarks = self.watermarks.lock().unwrap_or_else(|p| p.into_inner());
        watermarks
            .get(target)
            .map(|marks| {
                marks
                    .iter()
                    .filter(|((e, _), _)| e == entity)
                    .map(|((_, key), version)| (*key, *version))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn target_lock(&self, target: &NodeId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.target_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(target.clone()).or_default().clone()
    }

    fn running_for(&self, target: &NodeId) -> usize {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    fn adjust_running(&self, target: &NodeId, delta: isize) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        let count = running.entry(target.clone()).or_default();
        *count = count.saturating_add_signed(delta);
        if *count == 0 {
            running.remove(target);
        }
        metrics::set_sync_sessions_active(running.values().sum());
    }
}

fn interrupted(target: &NodeId, reason: impl ToString) -> CoordinatorError {
    CoordinatorError::SyncInterrupted {
        target: target.to_string(),
        message: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_store::MemoryEntityStore;
    use crate::sync_applier::SyncApplier;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::TransportEndpoint;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn entity(name: &str) -> EntityId {
        EntityId::new("Map", name)
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            ack_timeout: "300ms".to_string(),
            resync_deadline: "2s".to_string(),
            max_concurrent_keys: 2,
            max_attempts: 2,
            ..Default::default()
        }
    }

    /// Minimal passive: applies sync traffic and acks it.
    fn spawn_passive(endpoint: TransportEndpoint, store: Arc<MemoryEntityStore>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let TransportEndpoint {
                transport, mut inbound, ..
            } = endpoint;
            let applier = SyncApplier::new(transport.local_node().clone(), store);
            while let Some(msg) = inbound.recv().await {
                let ack = match msg.message {
                    GroupMessage::SyncBegin { session, entities } => Some(applier.on_sync_begin(session, entities).await),
                    GroupMessage::SyncEntityBegin { session, entity, units } => {
                        applier.on_entity_begin(session, entity, units).await;
                        None
                    }
                    GroupMessage::SyncEntity { session, unit } => applier.on_unit(session, unit).await.ok().flatten(),
                    GroupMessage::SyncEntityEnd { session, entity } => {
                        applier.on_entity_end(session, entity).await.ok().flatten()
                    }
                    GroupMessage::SyncComplete { session } => applier.on_sync_complete(session).await.ok().flatten(),
                    GroupMessage::Invoke { unit } => applier.on_invoke(unit).await.ok(),
                    _ => None,
                };
                if let Some(ack) = ack {
                    let _ = transport.send(&msg.from, GroupMessage::Ack { ack }).await;
                }
            }
        })
    }

    /// Feeds acks arriving at the active into the engine.
    fn spawn_ack_pump(
        mut inbound: tokio::sync::mpsc::UnboundedReceiver<crate::transport::Inbound>,
        engine: Arc<PassiveSyncEngine>,
    ) {
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                if let GroupMessage::Ack { ack } = msg.message {
                    engine.on_ack(&msg.from, &ack);
                }
            }
        });
    }

    async fn seeded_store() -> Arc<MemoryEntityStore> {
        let store = Arc::new(MemoryEntityStore::new());
        for name in ["orders", "users"] {
            for key in 0..3 {
                for _ in 0..4 {
                    store
                        .append(&entity(name), ConcurrencyKey(key), vec![key as u8])
                        .await
                        .unwrap();
                }
            }
        }
        store
    }

    fn engine_on(
        net: &MemoryNetwork,
        store: Arc<MemoryEntityStore>,
        config: SyncConfig,
    ) -> Arc<PassiveSyncEngine> {
        let endpoint = net.join("active");
        let engine = PassiveSyncEngine::new(NodeId::new("active"), config, store, endpoint.transport.clone());
        spawn_ack_pump(endpoint.inbound, engine.clone());
        engine
    }

    #[tokio::test]
    async fn test_full_sync_preserves_per_key_order() {
        let net = MemoryNetwork::new();
        let source = seeded_store().await;
        let engine = engine_on(&net, source.clone(), fast_config());

        let target_store = Arc::new(MemoryEntityStore::new());
        spawn_passive(net.join("p1"), target_store.clone());

        engine.sync_all(NodeId::new("p1")).wait_for().await.unwrap();

        assert_eq!(target_store.unit_count().await, source.unit_count().await);
        let mut last: HashMap<(EntityId, ConcurrencyKey), u64> = HashMap::new();
        for unit in target_store.applied_log().await {
            let prev = last.insert((unit.entity.clone(), unit.key), unit.version);
            assert!(prev.map_or(true, |p| p < unit.version), "unit applied out of order");
        }
        assert_eq!(engine.replication_targets(), vec![NodeId::new("p1")]);
        assert!(engine.acks.is_empty());
    }

    #[tokio::test]
    async fn test_repeat_sync_sends_nothing_new() {
        let net = MemoryNetwork::new();
        let source = seeded_store().await;
        let engine = engine_on(&net, source.clone(), fast_config());
        spawn_passive(net.join("p1"), Arc::new(MemoryEntityStore::new()));

        let unit_messages = Arc::new(AtomicUsize::new(0));
        let counter = unit_messages.clone();
        net.set_drop_rule(move |_, _, msg| {
            if matches!(msg, GroupMessage::SyncEntity { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            false
        });

        engine
            .sync_entities(NodeId::new("p1"), vec![entity("orders")])
            .wait_for()
            .await
            .unwrap();
        assert_eq!(unit_messages.load(Ordering::SeqCst), 12);

        engine
            .sync_entities(NodeId::new("p1"), vec![entity("orders")])
            .wait_for()
            .await
            .unwrap();
        assert_eq!(unit_messages.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_lost_target_resyncs_in_full_after_rejoin() {
        let net = MemoryNetwork::new();
        let source = seeded_store().await;
        let engine = engine_on(&net, source.clone(), fast_config());
        let p1 = NodeId::new("p1");

        // The first incarnation never acks units, so the session stalls mid-entity.
        net.set_drop_rule(|from, _, msg| {
            from.as_str() == "p1" && matches!(msg, GroupMessage::Ack { ack: AckRef::Unit { .. } })
        });
        let first = spawn_passive(net.join("p1"), Arc::new(MemoryEntityStore::new()));
        let request = engine.on_peer_role(&p1, Role::PassiveUninitialized).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        net.crash(&p1);
        engine.on_peer_lost(&p1);
        first.abort();
        net.clear_drop_rule();

        let fresh = Arc::new(MemoryEntityStore::new());
        spawn_passive(net.join("p1"), fresh.clone());
        assert!(engine.on_peer_role(&p1, Role::PassiveUninitialized).is_none());

        request.wait_for().await.unwrap();
        assert_eq!(fresh.unit_count().await, source.unit_count().await);
    }

    #[tokio::test]
    async fn test_target_that_never_returns_fails_request() {
        let net = MemoryNetwork::new();
        let config = SyncConfig {
            resync_deadline: "200ms".to_string(),
            ..fast_config()
        };
        let engine = engine_on(&net, seeded_store().await, config);
        let p1 = NodeId::new("p1");

        net.set_drop_rule(|_, _, msg| matches!(msg, GroupMessage::Ack { ack: AckRef::Unit { .. } }));
        let passive = spawn_passive(net.join("p1"), Arc::new(MemoryEntityStore::new()));
        let request = engine.sync_all(p1.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        net.crash(&p1);
        engine.on_peer_lost(&p1);
        passive.abort();

        let err = request.wait_for().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::SyncFailed { .. }));
        assert!(err.to_string().contains("did not rejoin"));
    }

    #[tokio::test]
    async fn test_ack_timeouts_exhaust_attempts() {
        let net = MemoryNetwork::new();
        let engine = engine_on(&net, seeded_store().await, fast_config());
        net.set_drop_rule(|_, _, msg| matches!(msg, GroupMessage::Ack { .. }));
        spawn_passive(net.join("p1"), Arc::new(MemoryEntityStore::new()));

        let err = engine.sync_all(NodeId::new("p1")).wait_for().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::SyncFailed { .. }));
        assert!(err.to_string().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_replicate_reaches_passives_only() {
        let net = MemoryNetwork::new();
        let source = Arc::new(MemoryEntityStore::new());
        let engine = engine_on(&net, source.clone(), fast_config());

        let passive_store = Arc::new(MemoryEntityStore::new());
        spawn_passive(net.join("p1"), passive_store.clone());
        let bystander_store = Arc::new(MemoryEntityStore::new());
        spawn_passive(net.join("p2"), bystander_store.clone());

        engine.on_peer_role(&NodeId::new("p1"), Role::Passive);
        engine.on_peer_role(&NodeId::new("p2"), Role::Uninitialized);

        let unit = source.append(&entity("orders"), ConcurrencyKey(0), vec![1]).await.unwrap();
        assert_eq!(engine.replicate(unit).await.unwrap(), 1);
        assert_eq!(passive_store.unit_count().await, 1);
        assert_eq!(bystander_store.unit_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_with_shutdown() {
        let net = MemoryNetwork::new();
        let engine = engine_on(&net, seeded_store().await, fast_config());
        net.set_drop_rule(|_, _, msg| matches!(msg, GroupMessage::Ack { .. }));
        spawn_passive(net.join("p1"), Arc::new(MemoryEntityStore::new()));

        let request = engine.sync_all(NodeId::new("p1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.close();

        assert!(matches!(request.wait_for().await, Err(CoordinatorError::Shutdown)));
        assert!(matches!(
            engine.sync_all(NodeId::new("p1")).wait_for().await,
            Err(CoordinatorError::Shutdown)
        ));
        assert_eq!(engine.active_sessions(), 0);
    }

    #[test]
    fn test_ack_registry() {
        let registry = AckRegistry::new();
        let a = NodeId::new("a");
        let ack = AckRef::SyncBegin { session: 1 };
        let mut rx = registry.register(a.clone(), ack.clone());
        assert!(!registry.resolve(&NodeId::new("b"), &ack));
        assert!(registry.resolve(&a, &ack));
        assert!(rx.try_recv().is_ok());

        let _rx = registry.register(a.clone(), ack.clone());
        assert_eq!(registry.fail_peer(&a), 1);
        assert!(registry.is_empty());
    }
}
