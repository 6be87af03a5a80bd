//! In-process stripe controller for failure-injection tests.
//!
//! Runs every server of a stripe inside the current runtime over one
//! [`MemoryNetwork`]. Each call returns once the requested process-level
//! action is done; waiting for roles to settle is a separate call.
//!
//! ```rust,ignore
//! let mut cluster = InProcessCluster::new(&["a", "b", "c"], FailoverPolicy::Consistency { voters: 1 }, HarnessStorage::Memory);
//! cluster.start_all().await?;
//! let active = cluster.wait_for_active(Duration::from_secs(5)).await?;
//! cluster.crash_server(&active).await?;
//! let next = cluster.wait_for_active(Duration::from_secs(5)).await?;
//! ```
//!
//! Every observation checks that no two mutually reachable servers are
//! ACTIVE at the same time.

use crate::config::{ClusterConfig, StateStoreConfig};
use crate::coordinator::ServerNode;
use crate::entity_store::MemoryEntityStore;
use crate::error::{CoordinatorError, Result};
use crate::state_store::{ClusterStateStore, MemoryStateBackend};
use crate::transport::memory::MemoryNetwork;
use crate::types::{FailoverPolicy, NodeId, Role};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Where servers keep their cluster state between restarts.
#[derive(Debug, Clone)]
pub enum HarnessStorage {
    /// One in-memory backend per server, kept across restarts.
    Memory,
    /// One SQLite file per server under this directory.
    Directory(PathBuf),
}

/// Per-server state that outlives incarnations. The entity store stands in
/// for a durable entity backend.
struct ServerSlot {
    memory_state: Arc<MemoryStateBackend>,
    entities: Arc<MemoryEntityStore>,
    node: Option<ServerNode>,
}

/// Start, stop, crash and observe the servers of one stripe.
pub struct InProcessCluster {
    network: MemoryNetwork,
    template: ClusterConfig,
    storage: HarnessStorage,
    servers: BTreeMap<NodeId, ServerSlot>,
    cut: BTreeSet<(NodeId, NodeId)>,
}

impl InProcessCluster {
    /// A stripe of `names` with test timings.
    pub fn new(names: &[&str], policy: FailoverPolicy, storage: HarnessStorage) -> Self {
        let first = names.first().copied().unwrap_or_default();
        let mut template = ClusterConfig::for_testing(first, names);
        template.failover = policy;
        Self::with_config(template, storage)
    }

    /// A stripe described by `template`. Its `server_name` is replaced per server.
    pub fn with_config(template: ClusterConfig, storage: HarnessStorage) -> Self {
        let servers = template
            .servers
            .iter()
            .map(|s| {
                (
                    s.node_id(),
                    ServerSlot {
                        memory_state: Arc::new(MemoryStateBackend::new()),
                        entities: Arc::new(MemoryEntityStore::new()),
                        node: None,
                    },
                )
            })
            .collect();
        Self {
            network: MemoryNetwork::new(),
            template,
            storage,
            servers,
            cut: BTreeSet::new(),
        }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn server_names(&self) -> Vec<NodeId> {
        self.servers.keys().cloned().collect()
    }

    fn slot(&self, name: &NodeId) -> Result<&ServerSlot> {
        self.servers
            .get(name)
            .ok_or_else(|| CoordinatorError::Config(format!("unknown server {}", name)))
    }

    fn slot_mut(&mut self, name: &NodeId) -> Result<&mut ServerSlot> {
        self.servers
            .get_mut(name)
            .ok_or_else(|| CoordinatorError::Config(format!("unknown server {}", name)))
    }

    /// The running server called `name`.
    pub fn node(&self, name: &NodeId) -> Option<&ServerNode> {
        self.servers.get(name).and_then(|slot| slot.node.as_ref())
    }

    /// Entity replica of `name`.
    pub fn entities(&self, name: &NodeId) -> Option<Arc<MemoryEntityStore>> {
        self.servers.get(name).map(|slot| slot.entities.clone())
    }

    pub fn is_running(&self, name: &NodeId) -> bool {
        self.node(name).is_some()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Process control
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn start_all(&mut self) -> Result<()> {
        for name in self.server_names() {
            if !self.is_running(&name) {
                self.start_server(&name).await?;
            }
        }
        Ok(())
    }

    /// Start a fresh incarnation of `name` over its persisted state.
    pub async fn start_server(&mut self, name: &NodeId) -> Result<()> {
        let entities = self.slot(name)?.entities.clone();
        if self.is_running(name) {
            return Err(CoordinatorError::Config(format!("server {} is already running", name)));
        }
        let mut config = self.template.clone();
        config.server_name = Some(name.to_string());

        let state_store = match &self.storage {
            HarnessStorage::Memory => ClusterStateStore::with_backend(self.slot(name)?.memory_state.clone()).await?,
            HarnessStorage::Directory(dir) => {
                let path = dir.join(format!("{}.db", name));
                config.state_store = StateStoreConfig::at_path(path.to_string_lossy().into_owned());
                ClusterStateStore::open(&config.state_store).await?
            }
        };

        let endpoint = self.network.join(name.clone());
        for (a, b) in &self.cut {
            if a == name || b == name {
                self.network.partition(a, b);
            }
        }

        match ServerNode::start_with_state(config, endpoint, state_store, entities).await {
            Ok(node) => {
                info!(server = %name, "Harness started server");
                self.slot_mut(name)?.node = Some(node);
                Ok(())
            }
            Err(e) => {
                self.network.crash(name);
                warn!(server = %name, error = %e, "Harness failed to start server");
                Err(e)
            }
        }
    }

    /// Graceful stop.
    pub async fn stop_server(&mut self, name: &NodeId) -> Result<()> {
        let node = self.slot_mut(name)?.node.take();
        if let Some(node) = node {
            node.shutdown().await;
            info!(server = %name, "Harness stopped server");
        }
        Ok(())
    }

    /// Abrupt stop: peers see the server as suspected and its store stays dirty.
    pub async fn crash_server(&mut self, name: &NodeId) -> Result<()> {
        let node = self.slot_mut(name)?.node.take();
        if let Some(node) = node {
            self.network.crash(name);
            node.kill().await;
            info!(server = %name, "Harness crashed server");
        }
        Ok(())
    }

    /// Crash `name` and start a new incarnation of it.
    pub async fn restart_server(&mut self, name: &NodeId) -> Result<()> {
        self.crash_server(name).await?;
        self.start_server(name).await
    }

    /// Wait for an active, crash it and start it again. Returns its name.
    ///
    /// The stripe has no known active when this returns.
    pub async fn restart_active(&mut self, timeout: Duration) -> Result<NodeId> {
        let victim = self.wait_for_active(timeout).await?;
        info!(server = %victim, "Harness restarting active");
        self.restart_server(&victim).await?;
        Ok(victim)
    }

    /// Stop everything, the active first.
    pub async fn shutdown(&mut self) {
        let roles = self.roles();
        let mut order: Vec<NodeId> = roles.iter().filter(|(_, r)| **r == Role::Active).map(|(n, _)| n.clone()).collect();
        order.extend(roles.keys().filter(|n| roles.get(*n) != Some(&Role::Active)).cloned());
        for name in order {
            if let Err(e) = self.stop_server(&name).await {
                warn!(server = %name, error = %e, "Harness failed to stop server");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Fault injection
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cut the link between `a` and `b`. The cut outlives restarts until healed.
    pub fn partition(&mut self, a: &NodeId, b: &NodeId) {
        self.cut.insert(ordered(a, b));
        self.network.partition(a, b);
    }

    pub fn heal(&mut self, a: &NodeId, b: &NodeId) {
        self.cut.remove(&ordered(a, b));
        self.network.heal(a, b);
    }

    fn reachable(&self, a: &NodeId, b: &NodeId) -> bool {
        !self.cut.contains(&ordered(a, b))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Observation
    // ═══════════════════════════════════════════════════════════════════════════

    /// Role of every running server.
    pub fn roles(&self) -> BTreeMap<NodeId, Role> {
        self.servers
            .iter()
            .filter_map(|(name, slot)| slot.node.as_ref().map(|node| (name.clone(), node.role())))
            .collect()
    }

    pub fn observed_role(&self, name: &NodeId) -> Option<Role> {
        self.node(name).map(|node| node.role())
    }

    /// The running actives. Two mutually reachable actives is an error.
    pub fn actives(&self) -> Result<Vec<NodeId>> {
        let actives: Vec<NodeId> = self
            .roles()
            .into_iter()
            .filter(|(_, role)| *role == Role::Active)
            .map(|(name, _)| name)
            .collect();
        for (i, a) in actives.iter().enumerate() {
            for b in &actives[i + 1..] {
                if self.reachable(a, b) {
                    return Err(CoordinatorError::Internal(format!(
                        "split brain: {} and {} are both ACTIVE and reachable",
                        a, b
                    )));
                }
            }
        }
        Ok(actives)
    }

    /// Wait until exactly one running server is ACTIVE.
    pub async fn wait_for_active(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            let actives = self.actives()?;
            if let [active] = actives.as_slice() {
                return Ok(active.clone());
            }
            if Instant::now() >= deadline {
                return Err(CoordinatorError::timeout(
                    format!("wait for active (roles {:?})", self.roles()),
                    "harness",
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until every running server is ACTIVE or PASSIVE.
    pub async fn wait_for_passive(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.actives()?;
            let roles = self.roles();
            if roles.values().all(|role| matches!(role, Role::Active | Role::Passive)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CoordinatorError::timeout(
                    format!("wait for passives (roles {:?})", roles),
                    "harness",
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn ordered(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> NodeId {
        NodeId::new(name)
    }

    #[tokio::test]
    async fn test_two_server_stripe_settles() {
        let mut cluster = InProcessCluster::new(&["a", "b"], FailoverPolicy::Availability, HarnessStorage::Memory);
        cluster.start_all().await.unwrap();

        let active = cluster.wait_for_active(Duration::from_secs(5)).await.unwrap();
        cluster.wait_for_passive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(active, id("a"));
        assert_eq!(cluster.observed_role(&id("b")), Some(Role::Passive));

        cluster.shutdown().await;
        assert!(cluster.roles().is_empty());
    }

    #[tokio::test]
    async fn test_restart_active_fails_over() {
        let mut cluster = InProcessCluster::new(&["a", "b"], FailoverPolicy::Availability, HarnessStorage::Memory);
        cluster.start_all().await.unwrap();
        cluster.wait_for_passive(Duration::from_secs(5)).await.unwrap();

        let victim = cluster.restart_active(Duration::from_secs(5)).await.unwrap();
        assert_eq!(victim, id("a"));

        cluster.wait_for_active(Duration::from_secs(5)).await.unwrap();
        cluster.wait_for_passive(Duration::from_secs(5)).await.unwrap();
        let roles: BTreeSet<Role> = cluster.roles().into_values().collect();
        assert_eq!(roles, [Role::Active, Role::Passive].into_iter().collect());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_server_rejected() {
        let mut cluster = InProcessCluster::new(&["a"], FailoverPolicy::Availability, HarnessStorage::Memory);
        assert!(matches!(
            cluster.start_server(&id("zz")).await,
            Err(CoordinatorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let mut cluster = InProcessCluster::new(&["a"], FailoverPolicy::Availability, HarnessStorage::Memory);
        cluster.start_server(&id("a")).await.unwrap();
        assert!(cluster.start_server(&id("a")).await.is_err());
        cluster.shutdown().await;
    }
}
