//! Configuration for a stripe member.
//!
//! Configuration is passed to [`ServerNode::start()`](crate::ServerNode::start)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use stripe_coordinator::config::{ClusterConfig, ServerConfig};
//! use stripe_coordinator::types::FailoverPolicy;
//!
//! let config = ClusterConfig {
//!     server_name: Some("node-1".into()),
//!     servers: vec![
//!         ServerConfig::new("node-1", "10.0.0.1", 9510),
//!         ServerConfig::new("node-2", "10.0.0.2", 9510),
//!     ],
//!     failover: FailoverPolicy::Consistency { voters: 1 },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ClusterConfig
//! ├── server_name: Option<String>   # This node (resolved if absent)
//! ├── group_id / stripe_name        # Replication group identity
//! ├── servers: Vec<ServerConfig>    # Stripe topology
//! ├── failover: FailoverPolicy      # AVAILABILITY | CONSISTENCY(N)
//! ├── voters: Vec<String>           # Voting members (default: all peers)
//! ├── settings: ClusterSettings
//! │   ├── transport: TransportConfig
//! │   ├── election: ElectionConfig
//! │   └── sync: SyncConfig
//! └── state_store: StateStoreConfig # SQLite cluster state
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! server_name: "node-1"
//! stripe_name: "stripe-a"
//! failover:
//!   type: consistency
//!   voters: 1
//! servers:
//!   - { name: "node-1", host: "10.0.0.1", port: 9510 }
//!   - { name: "node-2", host: "10.0.0.2", port: 9510 }
//!   - { name: "node-3", host: "10.0.0.3", port: 9510 }
//! settings:
//!   election:
//!     vote_timeout: "1s"
//! state_store:
//!   sqlite_path: "/var/lib/stripe/cluster-state.db"
//! ```

use crate::error::{CoordinatorError, Result};
use crate::types::{FailoverPolicy, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ServerNode::start()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for one stripe member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Name of the local server. When absent the local server is resolved
    /// from the topology (see [`resolve_local_server`](Self::resolve_local_server)).
    #[serde(default)]
    pub server_name: Option<String>,

    /// Replication group id persisted on first start.
    #[serde(default)]
    pub group_id: i32,

    /// Stripe name persisted on first start.
    #[serde(default = "default_stripe_name")]
    pub stripe_name: String,

    /// Every server of the stripe, including this one.
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub failover: FailoverPolicy,

    /// Servers whose votes count toward a CONSISTENCY quorum.
    /// Empty means every other server.
    #[serde(default)]
    pub voters: Vec<String>,

    #[serde(default)]
    pub settings: ClusterSettings,

    #[serde(default)]
    pub state_store: StateStoreConfig,
}

fn default_stripe_name() -> String {
    "stripe-0".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            group_id: 0,
            stripe_name: default_stripe_name(),
            servers: Vec::new(),
            failover: FailoverPolicy::default(),
            voters: Vec::new(),
            settings: ClusterSettings::default(),
            state_store: StateStoreConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Config for `local` in a loopback stripe of `servers`, with short timeouts
    /// and an in-memory state store.
    pub fn for_testing(local: &str, servers: &[&str]) -> Self {
        Self {
            server_name: Some(local.to_string()),
            group_id: 0,
            stripe_name: "test-stripe".to_string(),
            servers: servers
                .iter()
                .enumerate()
                .map(|(i, name)| ServerConfig::new(*name, "127.0.0.1", 9510 + i as u16))
                .collect(),
            failover: FailoverPolicy::Availability,
            voters: Vec::new(),
            settings: ClusterSettings::for_testing(),
            state_store: StateStoreConfig::in_memory(),
        }
    }

    /// Reject topologies the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(CoordinatorError::Config("no servers configured".into()));
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(CoordinatorError::Config("server with empty name".into()));
            }
            if !names.insert(server.name.as_str()) {
                return Err(CoordinatorError::Config(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
            if server.port == 0 {
                return Err(CoordinatorError::Config(format!(
                    "server '{}' has invalid port 0",
                    server.name
                )));
            }
            if server.host.trim().is_empty() {
                return Err(CoordinatorError::Config(format!(
                    "server '{}' has empty host",
                    server.name
                )));
            }
        }

        for voter in &self.voters {
            if !names.contains(voter.as_str()) {
                return Err(CoordinatorError::Config(format!(
                    "voter '{}' is not a configured server",
                    voter
                )));
            }
        }

        if let Some(name) = &self.server_name {
            if !names.contains(name.as_str()) {
                return Err(CoordinatorError::Config(format!(
                    "server_name '{}' is not a configured server",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Pick the server this process runs as.
    ///
    /// An explicit `server_name` always wins. A single-server topology picks
    /// that server. Otherwise the one server whose host resolves to an
    /// address bindable on this machine is chosen; zero or several matches
    /// is a configuration error. The last rule is a best-effort heuristic
    /// and multi-homed hosts should set `server_name`.
    pub fn resolve_local_server(&self) -> Result<&ServerConfig> {
        if let Some(name) = &self.server_name {
            return self
                .servers
                .iter()
                .find(|s| &s.name == name)
                .ok_or_else(|| CoordinatorError::Config(format!("unknown server_name '{}'", name)));
        }

        match self.servers.as_slice() {
            [] => Err(CoordinatorError::Config("no servers configured".into())),
            [only] => Ok(only),
            servers => {
                let local: Vec<&ServerConfig> = servers.iter().filter(|s| s.is_local_address()).collect();
                match local.as_slice() {
                    [one] => Ok(*one),
                    [] => Err(CoordinatorError::Config(
                        "no configured server matches a local address; set server_name".into(),
                    )),
                    many => Err(CoordinatorError::Config(format!(
                        "ambiguous local server, candidates: {}; set server_name",
                        many.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
                    ))),
                }
            }
        }
    }

    pub fn local_node_id(&self) -> Result<NodeId> {
        Ok(NodeId::new(self.resolve_local_server()?.name.clone()))
    }

    /// Every configured server except `local`.
    pub fn peers_of<'a>(&'a self, local: &'a NodeId) -> impl Iterator<Item = &'a ServerConfig> + 'a {
        self.servers.iter().filter(move |s| s.name != local.as_str())
    }

    /// Voting members as seen from `local`.
    pub fn voter_ids(&self, local: &NodeId) -> BTreeSet<NodeId> {
        if self.voters.is_empty() {
            self.peers_of(local).map(|s| NodeId::new(s.name.clone())).collect()
        } else {
            self.voters
                .iter()
                .filter(|v| v.as_str() != local.as_str())
                .map(|v| NodeId::new(v.clone()))
                .collect()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ServerConfig: one stripe member's address
// ═══════════════════════════════════════════════════════════════════════════════

/// Address of one server in the stripe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.name.clone())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve to the first socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| CoordinatorError::Config(format!("cannot resolve {}: {}", self.address(), e)))?
            .next()
            .ok_or_else(|| CoordinatorError::Config(format!("{} resolved to no addresses", self.address())))
    }

    fn is_local_address(&self) -> bool {
        let Ok(addrs) = (self.host.as_str(), 0).to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr| UdpSocket::bind(SocketAddr::new(addr.ip(), 0)).is_ok())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClusterSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables grouped by component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl ClusterSettings {
    pub fn for_testing() -> Self {
        Self {
            transport: TransportConfig::for_testing(),
            election: ElectionConfig::for_testing(),
            sync: SyncConfig::for_testing(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TransportConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Group transport timing and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Upper bound for handing one message to a peer connection.
    #[serde(default = "default_send_timeout")]
    pub send_timeout: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Connect attempts per send before the peer is reported unreachable.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    /// Silence after which a peer is suspected unreachable.
    #[serde(default = "default_suspect_after")]
    pub suspect_after: String,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Consecutive send failures before the peer circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout_sec: u64,
}

fn default_send_timeout() -> String {
    "5s".to_string()
}

fn default_connect_timeout() -> String {
    "2s".to_string()
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_heartbeat_interval() -> String {
    "1s".to_string()
}

fn default_suspect_after() -> String {
    "5s".to_string()
}

fn default_max_frame_bytes() -> usize {
    crate::wire::DEFAULT_MAX_FRAME_BYTES
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> u64 {
    30
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_timeout: default_send_timeout(),
            connect_timeout: default_connect_timeout(),
            connect_attempts: default_connect_attempts(),
            heartbeat_interval: default_heartbeat_interval(),
            suspect_after: default_suspect_after(),
            max_frame_bytes: default_max_frame_bytes(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout_sec: default_circuit_reset_timeout(),
        }
    }
}

impl TransportConfig {
    pub fn for_testing() -> Self {
        Self {
            send_timeout: "1s".to_string(),
            connect_timeout: "500ms".to_string(),
            connect_attempts: 2,
            heartbeat_interval: "100ms".to_string(),
            suspect_after: "600ms".to_string(),
            max_frame_bytes: 1024 * 1024,
            circuit_failure_threshold: 3,
            circuit_reset_timeout_sec: 1,
        }
    }

    pub fn send_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.send_timeout, Duration::from_secs(5))
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.connect_timeout, Duration::from_secs(2))
    }

    pub fn heartbeat_interval_duration(&self) -> Duration {
        parse_duration_or(&self.heartbeat_interval, Duration::from_secs(1))
    }

    pub fn suspect_after_duration(&self) -> Duration {
        parse_duration_or(&self.suspect_after, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ElectionConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Election and voting timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// How long a starting node listens for an existing active before
    /// standing for election.
    #[serde(default = "default_discovery_window")]
    pub discovery_window: String,

    /// How long a candidate waits for vote responses.
    #[serde(default = "default_vote_timeout")]
    pub vote_timeout: String,

    /// Pause before an outranked or interrupted candidate tries again.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,

    /// How long a granted vote binds the voter.
    #[serde(default = "default_vote_lease")]
    pub vote_lease: String,
}

fn default_discovery_window() -> String {
    "2s".to_string()
}

fn default_vote_timeout() -> String {
    "1s".to_string()
}

fn default_retry_delay() -> String {
    "500ms".to_string()
}

fn default_vote_lease() -> String {
    "5s".to_string()
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            discovery_window: default_discovery_window(),
            vote_timeout: default_vote_timeout(),
            retry_delay: default_retry_delay(),
            vote_lease: default_vote_lease(),
        }
    }
}

impl ElectionConfig {
    pub fn for_testing() -> Self {
        Self {
            discovery_window: "150ms".to_string(),
            vote_timeout: "300ms".to_string(),
            retry_delay: "100ms".to_string(),
            vote_lease: "1s".to_string(),
        }
    }

    pub fn discovery_window_duration(&self) -> Duration {
        parse_duration_or(&self.discovery_window, Duration::from_secs(2))
    }

    pub fn vote_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.vote_timeout, Duration::from_secs(1))
    }

    pub fn retry_delay_duration(&self) -> Duration {
        parse_duration_or(&self.retry_delay, Duration::from_millis(500))
    }

    pub fn vote_lease_duration(&self) -> Duration {
        parse_duration_or(&self.vote_lease, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Passive sync tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long to wait for a single ACK.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: String,

    /// How long a disconnected target has to rejoin before its sync is abandoned.
    #[serde(default = "default_resync_deadline")]
    pub resync_deadline: String,

    /// Concurrency keys synchronized in parallel per session.
    #[serde(default = "default_max_concurrent_keys")]
    pub max_concurrent_keys: usize,

    /// Attempts for a session whose ACKs time out while the target stays connected.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sync units per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_ack_timeout() -> String {
    "10s".to_string()
}

fn default_resync_deadline() -> String {
    "60s".to_string()
}

fn default_max_concurrent_keys() -> usize {
    16
}

fn default_max_attempts() -> u32 {
    3
}

fn default_false() -> bool {
    false
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ack_timeout: default_ack_timeout(),
            resync_deadline: default_resync_deadline(),
            max_concurrent_keys: default_max_concurrent_keys(),
            max_attempts: default_max_attempts(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            ack_timeout: "2s".to_string(),
            resync_deadline: "3s".to_string(),
            max_concurrent_keys: 4,
            max_attempts: 2,
            ..Default::default()
        }
    }

    pub fn ack_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.ack_timeout, Duration::from_secs(10))
    }

    pub fn resync_deadline_duration(&self) -> Duration {
        parse_duration_or(&self.resync_deadline, Duration::from_secs(60))
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StateStoreConfig: SQLite cluster state persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable cluster-state store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateStoreConfig {
    /// Path to SQLite database file.
    pub sqlite_path: String,

    /// Whether to use WAL mode (recommended for durability).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "cluster-state.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StateStoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn at_path(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: path.into(),
            wal_mode: true,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}
