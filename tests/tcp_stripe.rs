// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Whole stripes of real `ServerNode`s talking over loopback TCP.
//!
//! # Test Organization
//! - `tcp_stripe_*` - elections, membership and replication over sockets
//! - `tcp_failover_*` - leaving the stripe over sockets

mod common;

use common::{eventually, init_tracing, SETTLE};
use std::collections::BTreeMap;
use std::sync::Arc;
use stripe_coordinator::transport::tcp::TcpTransport;
use stripe_coordinator::{
    ClusterConfig, ConcurrencyKey, EntityId, FailoverPolicy, GroupTransport, MemoryEntityStore, MembershipEvent,
    NodeId, ReplicatedStore, Role, ServerNode,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

struct TcpServer {
    id: NodeId,
    node: ServerNode,
    entities: Arc<MemoryEntityStore>,
    membership: broadcast::Receiver<MembershipEvent>,
}

impl TcpServer {
    /// Every membership event seen since start.
    fn drain_membership(&mut self) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.membership.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Bind every listener first so no server dials a closed port.
async fn tcp_stripe(names: &[&str], policy: FailoverPolicy) -> Vec<TcpServer> {
    init_tracing();
    let mut listeners = Vec::new();
    for _ in names {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let ports: Vec<u16> = listeners.iter().map(|l| l.local_addr().unwrap().port()).collect();

    let mut endpoints = Vec::new();
    for (name, listener) in names.iter().zip(listeners) {
        let mut config = ClusterConfig::for_testing(name, names);
        config.failover = policy;
        for (server, port) in config.servers.iter_mut().zip(&ports) {
            server.port = *port;
        }
        let endpoint = TcpTransport::with_listener(&config, listener).unwrap();
        let membership = endpoint.transport.subscribe_membership();
        endpoints.push((config, endpoint, membership));
    }

    let mut servers = Vec::new();
    for (config, endpoint, membership) in endpoints {
        let id = config.local_node_id().unwrap();
        let entities = Arc::new(MemoryEntityStore::new());
        let store: Arc<dyn ReplicatedStore> = entities.clone();
        let node = ServerNode::start(config, endpoint, store).await.unwrap();
        servers.push(TcpServer {
            id,
            node,
            entities,
            membership,
        });
    }
    servers
}

fn roles(servers: &[TcpServer]) -> BTreeMap<NodeId, Role> {
    servers.iter().map(|s| (s.id.clone(), s.node.role())).collect()
}

/// Wait for one ACTIVE with every other server PASSIVE; returns the active.
async fn settled(servers: &[TcpServer]) -> NodeId {
    let ok = eventually(SETTLE, || {
        let roles = roles(servers);
        async move {
            roles.values().filter(|r| **r == Role::Active).count() == 1
                && roles.values().filter(|r| **r == Role::Passive).count() == roles.len() - 1
        }
    })
    .await;
    assert!(ok, "stripe did not settle: {:?}", roles(servers));
    servers
        .iter()
        .find(|s| s.node.role() == Role::Active)
        .map(|s| s.id.clone())
        .unwrap()
}

async fn shutdown_all(servers: &[TcpServer]) {
    for server in servers {
        server.node.shutdown().await;
    }
}

// =============================================================================
// Stripe Tests
// =============================================================================

#[tokio::test]
async fn tcp_stripe_settles_with_stable_membership() {
    let mut servers = tcp_stripe(&["node-1", "node-2", "node-3"], FailoverPolicy::Consistency { voters: 1 }).await;
    let active = settled(&servers).await;

    // Quiet for many heartbeat periods
    let quiet = ClusterConfig::for_testing("node-1", &["node-1"])
        .settings
        .transport
        .heartbeat_interval_duration()
        * 10;
    tokio::time::sleep(quiet).await;
    assert_eq!(settled(&servers).await, active);

    for server in &mut servers {
        let id = server.id.clone();
        let events = server.drain_membership();
        let mut joined: Vec<NodeId> = events
            .iter()
            .filter_map(|e| match e {
                MembershipEvent::Joined(peer) => Some(peer.clone()),
                _ => None,
            })
            .collect();
        joined.sort();
        let mut expected: Vec<NodeId> = ["node-1", "node-2", "node-3"]
            .into_iter()
            .map(NodeId::new)
            .filter(|n| *n != id)
            .collect();
        expected.sort();
        assert_eq!(joined, expected, "{} saw {:?}", id, events);
        assert!(events.iter().all(|e| !e.is_loss()), "{} lost a peer: {:?}", id, events);
    }

    shutdown_all(&servers).await;
}

#[tokio::test]
async fn tcp_stripe_replicates_invocations() {
    let servers = tcp_stripe(&["node-1", "node-2", "node-3"], FailoverPolicy::Availability).await;
    let active = settled(&servers).await;
    let node = &servers.iter().find(|s| s.id == active).unwrap().node;

    let entity = EntityId::new("Map", "orders");
    for i in 0..5u8 {
        node.invoke(&entity, ConcurrencyKey(u32::from(i % 2)), vec![i]).await.unwrap();
    }

    for server in servers.iter().filter(|s| s.id != active) {
        assert_eq!(server.entities.versions(&entity, ConcurrencyKey(0)).await, vec![1, 2, 3]);
        assert_eq!(server.entities.versions(&entity, ConcurrencyKey(1)).await, vec![1, 2]);
        assert_eq!(server.node.known_active(), Some(active.clone()));
    }

    shutdown_all(&servers).await;
}

// =============================================================================
// Failover Tests
// =============================================================================

#[tokio::test]
async fn tcp_failover_graceful_stop_promotes_sole_survivor() {
    let mut servers = tcp_stripe(&["node-1", "node-2"], FailoverPolicy::Consistency { voters: 1 }).await;
    let active = settled(&servers).await;
    let index = servers.iter().position(|s| s.id == active).unwrap();
    let leaving = servers.remove(index);
    let mut survivor = servers.remove(0);

    leaving.node.shutdown().await;
    survivor.node.wait_for_role(Role::Active, SETTLE).await.unwrap();

    let events = survivor.drain_membership();
    assert!(events.contains(&MembershipEvent::Left(active.clone())), "saw {:?}", events);
    assert!(!events.contains(&MembershipEvent::Suspected(active.clone())), "saw {:?}", events);
    assert!(!survivor.node.consistency_control().is_blocked());

    survivor.node.shutdown().await;
}
