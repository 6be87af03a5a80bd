// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stripe server node.
//!
//! The orchestrator that ties together:
//! - Group messaging via a [`GroupTransport`]
//! - Role lifecycle via [`RoleStateMachine`]
//! - Failover policy via [`ConsistencyManager`]
//! - Active-side sync via [`PassiveSyncEngine`], passive side via [`SyncApplier`]
//! - Durable role recovery via [`ClusterStateStore`]
//!
//! # Startup
//!
//! 1. Check and stamp the schema version, log an unclean previous shutdown,
//!    mark the store dirty
//! 2. Start in UNINITIALIZED whatever role was persisted
//! 3. Spawn the dispatch task (inbound messages, membership, resolutions)
//!    and the election task
//! 4. After the discovery window, a node that heard of no ACTIVE stands
//!    for election
//!
//! # Shutdown
//!
//! [`shutdown()`](ServerNode::shutdown) announces STOPPED, says goodbye,
//! fails sync waiters and marks the store clean. [`kill()`](ServerNode::kill)
//! stops everything without telling anyone and leaves the store dirty.

mod dispatch;
mod election;
mod types;

pub use types::{HealthCheck, NodeState};

use crate::config::ClusterConfig;
use crate::consistency::ConsistencyManager;
use crate::control::ConsistencyControl;
use crate::entity_store::ReplicatedStore;
use crate::error::{CoordinatorError, Result};
use crate::metrics;
use crate::passive_sync::{PassiveSyncEngine, SyncRequest};
use crate::role::RoleStateMachine;
use crate::state_store::ClusterStateStore;
use crate::sync_applier::SyncApplier;
use crate::transport::{GroupTransport, TransportEndpoint};
use crate::types::{ConcurrencyKey, EntityId, EntitySyncUnit, GroupId, NodeId, Role, StripeId};
use election::ElectionState;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// What this node believes about the rest of the stripe.
#[derive(Debug, Default)]
struct ClusterView {
    peer_roles: HashMap<NodeId, Role>,
    known_active: Option<NodeId>,
    /// The active this node's replica was last synced from.
    synced_from: Option<NodeId>,
    /// Peers whose last membership event was a graceful leave.
    departed: HashSet<NodeId>,
}

/// State shared by the node handle and its background tasks.
struct NodeShared {
    node_id: NodeId,
    stripe_id: StripeId,
    config: ClusterConfig,
    /// Every other configured server.
    peers: Vec<NodeId>,
    /// Persisted role at startup was ACTIVE.
    was_active: bool,
    role: Arc<RoleStateMachine>,
    consistency: Arc<ConsistencyManager>,
    transport: Arc<dyn GroupTransport>,
    state_store: ClusterStateStore,
    entities: Arc<dyn ReplicatedStore>,
    sync: Arc<PassiveSyncEngine>,
    applier: SyncApplier,
    view: Mutex<ClusterView>,
    election: ElectionState,
    election_kick: Notify,
    invoke_locks: Mutex<HashMap<(EntityId, ConcurrencyKey), Arc<tokio::sync::Mutex<()>>>>,
}

impl NodeShared {
    fn view(&self) -> std::sync::MutexGuard<'_, ClusterView> {
        self.view.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn known_active(&self) -> Option<NodeId> {
        self.view().known_active.clone()
    }

    /// Every other configured server left gracefully.
    fn is_sole_survivor(&self) -> bool {
        let view = self.view();
        self.peers.iter().all(|peer| view.departed.contains(peer))
    }

    fn kick_election(&self) {
        self.election_kick.notify_one();
    }

    /// Bookkeeping after this node committed ACTIVE.
    fn on_became_active(&self) {
        let peers: Vec<(NodeId, Role)> = {
            let mut view = self.view();
            view.known_active = Some(self.node_id.clone());
            view.synced_from = None;
            view.peer_roles.iter().map(|(p, r)| (p.clone(), *r)).collect()
        };
        info!(node_id = %self.node_id, stripe_id = %self.stripe_id, "Serving as active");
        for (peer, role) in peers {
            let _ = self.sync.on_peer_role(&peer, role);
        }
    }

    /// Split-brain loser: stop serving and fail everything waiting on us.
    async fn zap(&self, winner: &NodeId) {
        warn!(node_id = %self.node_id, winner = %winner, "Two actives observed, stopping this node");
        metrics::record_zap(self.node_id.as_str());
        self.sync.close();
        self.applier.discard().await;
        self.role.stop("split-brain").await;
    }

    fn invoke_lock(&self, entity: &EntityId, key: ConcurrencyKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.invoke_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry((entity.clone(), key)).or_default().clone()
    }
}

/// One server of a stripe.
pub struct ServerNode {
    shared: Arc<NodeShared>,
    control: ConsistencyControl,
    state_tx: watch::Sender<NodeState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerNode {
    /// Open the configured state store and start the node.
    ///
    /// A state store that cannot be opened aborts startup: the node cannot
    /// know what role it last held.
    pub async fn start(
        config: ClusterConfig,
        endpoint: TransportEndpoint,
        entities: Arc<dyn ReplicatedStore>,
    ) -> Result<Self> {
        config.validate()?;
        let state_store = ClusterStateStore::open(&config.state_store).await?;
        Self::start_with_state(config, endpoint, state_store, entities).await
    }

    /// Start the node over an already opened state store.
    pub async fn start_with_state(
        config: ClusterConfig,
        endpoint: TransportEndpoint,
        state_store: ClusterStateStore,
        entities: Arc<dyn ReplicatedStore>,
    ) -> Result<Self> {
        config.validate()?;
        let node_id = config.local_node_id()?;
        if endpoint.local_node() != &node_id {
            return Err(CoordinatorError::Config(format!(
                "transport is bound as {} but the local server is {}",
                endpoint.local_node(),
                node_id
            )));
        }

        let (state_tx, _) = watch::channel(NodeState::Starting);
        info!(
            node_id = %node_id,
            servers = config.servers.len(),
            policy = %config.failover,
            "Starting stripe server"
        );

        let stripe_id = StripeId::new(config.stripe_name.clone());
        if let Err(e) = Self::prepare_state(&node_id, &config, &stripe_id, &state_store).await {
            state_tx.send_replace(NodeState::Failed);
            warn!(node_id = %node_id, error = %e, "Startup aborted");
            return Err(e);
        }

        let initial_role = state_store.initial_role();
        if let Some(role) = initial_role {
            info!(node_id = %node_id, persisted_role = %role, "Recovered persisted role (renegotiating)");
        }

        let TransportEndpoint {
            transport,
            inbound,
            membership,
        } = endpoint;

        let consistency = Arc::new(ConsistencyManager::new(
            node_id.clone(),
            config.failover,
            config.voter_ids(&node_id),
        ));
        let role = Arc::new(RoleStateMachine::new(
            node_id.clone(),
            stripe_id.clone(),
            consistency.clone(),
            Arc::new(state_store.clone()),
            transport.clone(),
        ));
        let sync = PassiveSyncEngine::new(
            node_id.clone(),
            config.settings.sync.clone(),
            entities.clone(),
            transport.clone(),
        );
        let control = ConsistencyControl::new(node_id.clone(), consistency.clone(), transport.clone());
        let resolutions = consistency.subscribe_resolutions();

        let shared = Arc::new(NodeShared {
            peers: config.peers_of(&node_id).map(|s| s.node_id()).collect(),
            was_active: initial_role == Some(Role::Active),
            election: ElectionState::new(config.settings.election.vote_lease_duration()),
            applier: SyncApplier::new(node_id.clone(), entities.clone()),
            node_id: node_id.clone(),
            stripe_id,
            config,
            role,
            consistency,
            transport,
            state_store,
            entities,
            sync,
            view: Mutex::new(ClusterView::default()),
            election_kick: Notify::new(),
            invoke_locks: Mutex::new(HashMap::new()),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatch_task = tokio::spawn(
            dispatch::run_dispatch(shared.clone(), inbound, membership, resolutions, shutdown_rx.clone())
                .instrument(info_span!("dispatch", node_id = %node_id)),
        );
        let election_task = tokio::spawn(
            election::run_elections(shared.clone(), shutdown_rx)
                .instrument(info_span!("elections", node_id = %node_id)),
        );

        state_tx.send_replace(NodeState::Running);
        Ok(Self {
            shared,
            control,
            state_tx,
            shutdown_tx,
            tasks: Mutex::new(vec![dispatch_task, election_task]),
        })
    }

    async fn prepare_state(
        node_id: &NodeId,
        config: &ClusterConfig,
        stripe_id: &StripeId,
        state_store: &ClusterStateStore,
    ) -> Result<()> {
        state_store.check_and_stamp_version().await?;
        if !state_store.is_clean_shutdown().await? {
            warn!(node_id = %node_id, "Previous run did not shut down cleanly");
        }
        state_store.set_clean_shutdown(false).await?;

        let persisted_stripe = state_store.stripe_id().await?;
        if !persisted_stripe.is_null() && &persisted_stripe != stripe_id {
            warn!(
                node_id = %node_id,
                persisted = %persisted_stripe,
                configured = %stripe_id,
                "Persisted stripe id differs from configuration"
            );
        }
        let group = GroupId(config.group_id);
        if state_store.group_id().await?.is_null() {
            state_store.set_group_id(group).await?;
        }
        state_store.set_stripe_id_for(group, stripe_id).await?;
        Ok(())
    }

    pub fn node_id(&self) -> &NodeId {
        &self.shared.node_id
    }

    pub fn state(&self) -> NodeState {
        *self.state_tx.borrow()
    }

    pub fn role(&self) -> Role {
        self.shared.role.current()
    }

    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.shared.role.subscribe()
    }

    /// The active this node follows, itself when active.
    pub fn known_active(&self) -> Option<NodeId> {
        self.shared.known_active()
    }

    pub fn consistency_control(&self) -> &ConsistencyControl {
        &self.control
    }

    pub fn state_store(&self) -> &ClusterStateStore {
        &self.shared.state_store
    }

    pub fn entities(&self) -> &Arc<dyn ReplicatedStore> {
        &self.shared.entities
    }

    /// Apply a client invocation and replicate it to every passive.
    ///
    /// Invocations on one `(entity, key)` are serialized so passives see
    /// versions in order.
    pub async fn invoke(&self, entity: &EntityId, key: ConcurrencyKey, payload: Vec<u8>) -> Result<EntitySyncUnit> {
        let role = self.role();
        if role != Role::Active {
            return Err(CoordinatorError::NotActive { role });
        }

        let lock = self.shared.invoke_lock(entity, key);
        let _ordered = lock.lock().await;
        let unit = self.shared.entities.append(entity, key, payload).await?;
        let acked = self.shared.sync.replicate(unit.clone()).await?;
        debug!(
            node_id = %self.shared.node_id,
            entity = %entity,
            key = %key,
            version = unit.version,
            passives = acked,
            "Invocation replicated"
        );
        Ok(unit)
    }

    /// Sync the named entities to `target`. Only the active syncs.
    pub fn sync_entities(&self, target: NodeId, entities: Vec<EntityId>) -> Result<SyncRequest> {
        let role = self.role();
        if role != Role::Active {
            return Err(CoordinatorError::NotActive { role });
        }
        Ok(self.shared.sync.sync_entities(target, entities))
    }

    /// Wait until this node holds `role`.
    pub async fn wait_for_role(&self, role: Role, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe_role();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|r| *r == role))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CoordinatorError::Shutdown),
            Err(_) => Err(CoordinatorError::timeout(
                format!("wait for {} (currently {})", role, self.role()),
                self.shared.node_id.as_str(),
            )),
        }
    }

    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let role = self.role();
        let reachable_peers = self.shared.transport.members().len();
        HealthCheck {
            node_id: self.shared.node_id.clone(),
            state,
            role,
            known_active: self.known_active(),
            reachable_peers,
            transition_blocked: self.control.is_blocked(),
            sync_sessions: self.shared.sync.active_sessions(),
            pending_acks: self.shared.sync.pending_acks(),
            healthy: state == NodeState::Running && matches!(role, Role::Active | Role::Passive),
        }
    }

    /// Graceful stop: announce STOPPED, leave the group, mark the store clean.
    pub async fn shutdown(&self) {
        if !self.begin_stop() {
            return;
        }
        info!(node_id = %self.shared.node_id, role = %self.role(), "Shutting down stripe server");

        self.shared.sync.close();
        self.shared.role.stop("shutdown").await;
        self.join_tasks().await;
        self.shared.transport.shutdown().await.ok();
        self.shared.applier.discard().await;

        if let Err(e) = self.shared.state_store.set_clean_shutdown(true).await {
            warn!(node_id = %self.shared.node_id, error = %e, "Failed to mark clean shutdown");
        }
        if let Err(e) = self.shared.state_store.close().await {
            warn!(node_id = %self.shared.node_id, error = %e, "Failed to close state store");
        }

        self.state_tx.send_replace(NodeState::Stopped);
        info!(node_id = %self.shared.node_id, "Stripe server stopped");
    }

    /// Abrupt stop. Nothing is announced and the store stays dirty.
    ///
    /// Peers only notice through the transport, so the caller is expected
    /// to sever it (as a crashed process would).
    pub async fn kill(&self) {
        if !self.begin_stop() {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            task.abort();
        }
        self.shared.sync.close();
        self.shared.role.halt();
        if let Err(e) = self.shared.state_store.close().await {
            debug!(node_id = %self.shared.node_id, error = %e, "State store close after kill failed");
        }
        self.state_tx.send_replace(NodeState::Stopped);
        warn!(node_id = %self.shared.node_id, "Stripe server killed");
    }

    fn begin_stop(&self) -> bool {
        let proceed = self.state_tx.send_if_modified(|state| {
            if matches!(state, NodeState::Running | NodeState::Starting) {
                *state = NodeState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if proceed {
            let _ = self.shutdown_tx.send(true);
        }
        proceed
    }

    async fn join_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        let drain_timeout = self.shared.config.settings.transport.send_timeout_duration();
        for (i, task) in tasks.into_iter().enumerate() {
            let abort = task.abort_handle();
            match tokio::time::timeout(drain_timeout, task).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => {
                    warn!(task = i + 1, "Task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
    }
}
