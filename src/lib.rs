//! # Stripe Coordinator
//!
//! Coordination and replication for one stripe of servers: one ACTIVE
//! serving client entity requests, the rest PASSIVE replicas ready to take
//! over.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             ServerNode                               │
//! │                                                                      │
//! │  ┌────────────────┐    ┌────────────────┐    ┌────────────────────┐  │
//! │  │ GroupTransport │───►│ dispatch       │───►│ RoleStateMachine   │  │
//! │  │ (memory / tcp) │    │ + elections    │    │ gate → persist →   │  │
//! │  └────────────────┘    └────────────────┘    │ apply → announce   │  │
//! │          ▲                     │             └────────────────────┘  │
//! │          │                     ▼                  │            │     │
//! │  ┌────────────────┐    ┌────────────────┐    ┌───────────┐┌────────┐ │
//! │  │ wire frames    │◄───│ PassiveSync /  │    │Consistency││Cluster │ │
//! │  │ (24-byte hdr)  │    │ SyncApplier    │    │ Manager   ││ State  │ │
//! │  └────────────────┘    └────────────────┘    └───────────┘└────────┘ │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failover policies
//!
//! - **Availability**: any eligible node may promote. Partitions can produce
//!   two actives; they are resolved deterministically when the link heals.
//! - **Consistency(N)**: promotion needs N voter grants (or sole
//!   survivorship). Otherwise it stays blocked until membership changes or
//!   an operator calls [`ConsistencyControl::allow_transition`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stripe_coordinator::{ClusterConfig, ServerNode, MemoryEntityStore};
//! use stripe_coordinator::transport::memory::MemoryNetwork;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let network = MemoryNetwork::new();
//!     let config = ClusterConfig::for_testing("a", &["a"]);
//!     let node = ServerNode::start(config, network.join("a"), Arc::new(MemoryEntityStore::new()))
//!         .await
//!         .expect("Failed to start");
//!
//!     // Serve until told to stop
//!     node.shutdown().await;
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod consistency;
pub mod control;
pub mod coordinator;
pub mod entity_store;
pub mod error;
pub mod harness;
pub mod metrics;
pub mod passive_sync;
pub mod protocol;
pub mod resilience;
pub mod role;
pub mod state_store;
pub mod sync_applier;
pub mod transport;
pub mod types;
pub mod wire;

// Re-exports for convenience
pub use config::{ClusterConfig, ClusterSettings, ElectionConfig, ServerConfig, StateStoreConfig, SyncConfig, TransportConfig};
pub use consistency::{ConsistencyManager, TransitionRequest, VoteTally};
pub use control::ConsistencyControl;
pub use coordinator::{HealthCheck, NodeState, ServerNode};
pub use entity_store::{ApplyOutcome, MemoryEntityStore, ReplicatedStore};
pub use error::{BoxFuture, CoordinatorError, ErrorKind, Result};
pub use harness::{HarnessStorage, InProcessCluster};
pub use passive_sync::{PassiveSyncEngine, SyncRequest, SyncStatus};
pub use role::{RoleStateMachine, TransitionOutcome};
pub use state_store::{ClusterStateRecord, ClusterStateStore};
pub use transport::{GroupTransport, MembershipEvent, TransportEndpoint};
pub use types::{ConcurrencyKey, EntityId, EntitySyncUnit, FailoverPolicy, GroupId, NodeId, Role, StripeId};
