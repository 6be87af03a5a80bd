//! In-process group transport.
//!
//! A [`MemoryNetwork`] is a hub every node joins. Delivery is an unbounded
//! channel push under one lock, so per-pair order is preserved. Fault
//! injection:
//!
//! - [`leave`](MemoryNetwork::leave): graceful, peers see `Left`
//! - [`crash`](MemoryNetwork::crash): abrupt, peers see `Suspected`
//! - [`partition`](MemoryNetwork::partition) / [`heal`](MemoryNetwork::heal):
//!   cut and restore one link, both sides see `Suspected` then `Joined`
//! - [`set_drop_rule`](MemoryNetwork::set_drop_rule): silently lose matching
//!   messages (the sender still sees success, as with a lost packet)
//!
//! A node that rejoins after a crash gets a fresh generation; the transport
//! handed out to its previous incarnation stops working.

use super::{BroadcastReport, GroupTransport, Inbound, MembershipEvent, TransportEndpoint, MEMBERSHIP_CHANNEL_CAPACITY};
use crate::error::{BoxFuture, CoordinatorError, Result};
use crate::metrics;
use crate::protocol::GroupMessage;
use crate::types::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Predicate deciding whether a message from `from` to `to` is lost.
pub type DropRule = Arc<dyn Fn(&NodeId, &NodeId, &GroupMessage) -> bool + Send + Sync>;

struct NodeSlot {
    generation: u64,
    inbound: mpsc::UnboundedSender<Inbound>,
    membership: broadcast::Sender<MembershipEvent>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeId, NodeSlot>,
    cut: HashSet<(NodeId, NodeId)>,
    next_generation: u64,
    drop_rule: Option<DropRule>,
}

impl NetworkState {
    fn link_cut(&self, a: &NodeId, b: &NodeId) -> bool {
        self.cut.contains(&ordered(a, b))
    }

    fn notify(&self, to: &NodeId, event: MembershipEvent) {
        if let Some(slot) = self.nodes.get(to) {
            metrics::record_membership_event(event.kind());
            let _ = slot.membership.send(event);
        }
    }

    fn reachable_from<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a NodeId> + 'a {
        self.nodes
            .keys()
            .filter(move |other| *other != node && !self.link_cut(node, other))
    }
}

fn ordered(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Shared in-process hub.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Attach `node`. Replaces any previous incarnation without notifying
    /// peers of its loss; call [`crash`](Self::crash) first for that.
    pub fn join(&self, node: impl Into<NodeId>) -> TransportEndpoint {
        let node = node.into();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (membership_tx, membership_rx) = broadcast::channel(MEMBERSHIP_CHANNEL_CAPACITY);

        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.nodes.insert(
            node.clone(),
            NodeSlot {
                generation,
                inbound: inbound_tx,
                membership: membership_tx.clone(),
            },
        );

        let others: Vec<NodeId> = state.reachable_from(&node).cloned().collect();
        for other in &others {
            state.notify(other, MembershipEvent::Joined(node.clone()));
            state.notify(&node, MembershipEvent::Joined(other.clone()));
        }
        drop(state);

        info!(node_id = %node, generation, peers = others.len(), "Node joined memory network");

        TransportEndpoint {
            transport: Arc::new(MemoryTransport {
                node,
                generation,
                network: self.clone(),
                membership: membership_tx,
            }),
            inbound: inbound_rx,
            membership: membership_rx,
        }
    }

    /// Graceful departure: peers see `Left`.
    pub fn leave(&self, node: &NodeId) {
        self.remove(node, None, MembershipEvent::Left(node.clone()));
    }

    /// Abrupt loss: peers see `Suspected`.
    pub fn crash(&self, node: &NodeId) {
        self.remove(node, None, MembershipEvent::Suspected(node.clone()));
    }

    fn remove(&self, node: &NodeId, generation: Option<u64>, event: MembershipEvent) {
        let mut state = self.lock();
        match state.nodes.get(node) {
            Some(slot) if generation.map_or(true, |g| g == slot.generation) => {}
            _ => return,
        }
        state.nodes.remove(node);
        let others: Vec<NodeId> = state.reachable_from(node).cloned().collect();
        for other in &others {
            state.notify(other, event.clone());
        }
        info!(node_id = %node, event = %event, "Node removed from memory network");
    }

    /// Cut the link between `a` and `b`.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        let mut state = self.lock();
        if !state.cut.insert(ordered(a, b)) {
            return;
        }
        state.notify(a, MembershipEvent::Suspected(b.clone()));
        state.notify(b, MembershipEvent::Suspected(a.clone()));
        info!(a = %a, b = %b, "Partitioned link");
    }

    /// Restore the link between `a` and `b`.
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        let mut state = self.lock();
        if !state.cut.remove(&ordered(a, b)) {
            return;
        }
        if state.nodes.contains_key(a) && state.nodes.contains_key(b) {
            state.notify(a, MembershipEvent::Joined(b.clone()));
            state.notify(b, MembershipEvent::Joined(a.clone()));
        }
        info!(a = %a, b = %b, "Healed link");
    }

    /// Lose messages matching `rule` until [`clear_drop_rule`](Self::clear_drop_rule).
    pub fn set_drop_rule<F>(&self, rule: F)
    where
        F: Fn(&NodeId, &NodeId, &GroupMessage) -> bool + Send + Sync + 'static,
    {
        self.lock().drop_rule = Some(Arc::new(rule));
    }

    pub fn clear_drop_rule(&self) {
        self.lock().drop_rule = None;
    }

    pub fn is_member(&self, node: &NodeId) -> bool {
        self.lock().nodes.contains_key(node)
    }

    fn deliver(&self, from: &NodeId, generation: u64, to: &NodeId, message: GroupMessage) -> Result<()> {
        let state = self.lock();
        match state.nodes.get(from) {
            Some(slot) if slot.generation == generation => {}
            _ => return Err(CoordinatorError::transport(to.as_str(), "sender is not attached")),
        }
        if state.link_cut(from, to) {
            return Err(CoordinatorError::transport(to.as_str(), "link partitioned"));
        }
        let slot = state
            .nodes
            .get(to)
            .ok_or_else(|| CoordinatorError::transport(to.as_str(), "peer unreachable"))?;

        if let Some(rule) = &state.drop_rule {
            if rule(from, to, &message) {
                debug!(from = %from, to = %to, message_type = %message.message_type(), "Dropping message");
                return Ok(());
            }
        }

        slot.inbound
            .send(Inbound {
                from: from.clone(),
                message,
            })
            .map_err(|_| CoordinatorError::transport(to.as_str(), "peer inbound closed"))
    }

    fn members_of(&self, node: &NodeId) -> Vec<NodeId> {
        let state = self.lock();
        if !state.nodes.contains_key(node) {
            return Vec::new();
        }
        let mut members: Vec<NodeId> = state.reachable_from(node).cloned().collect();
        members.sort();
        members
    }
}

/// One node's handle on a [`MemoryNetwork`].
pub struct MemoryTransport {
    node: NodeId,
    generation: u64,
    network: MemoryNetwork,
    membership: broadcast::Sender<MembershipEvent>,
}

impl GroupTransport for MemoryTransport {
    fn local_node(&self) -> &NodeId {
        &self.node
    }

    fn send<'a>(&'a self, target: &'a NodeId, message: GroupMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let result = self.network.deliver(&self.node, self.generation, target, message);
            if result.is_err() {
                metrics::record_send_failure(target.as_str());
            }
            result
        })
    }

    fn broadcast(&self, message: GroupMessage) -> BoxFuture<'_, BroadcastReport> {
        Box::pin(async move {
            let targets = self.network.members_of(&self.node);
            let report = targets
                .into_iter()
                .map(|target| {
                    let result = self.network.deliver(&self.node, self.generation, &target, message.clone());
                    (target, result)
                })
                .collect();
            Ok(report)
        })
    }

    fn members(&self) -> Vec<NodeId> {
        self.network.members_of(&self.node)
    }

    fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership.subscribe()
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.network
                .remove(&self.node, Some(self.generation), MembershipEvent::Left(self.node.clone()));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn heartbeat() -> GroupMessage {
        GroupMessage::Heartbeat { role: Role::Passive }
    }

    #[tokio::test]
    async fn test_join_announces_both_ways() {
        let net = MemoryNetwork::new();
        let mut a = net.join("a");
        let mut b = net.join("b");

        assert_eq!(a.membership.recv().await.unwrap(), MembershipEvent::Joined(NodeId::new("b")));
        assert_eq!(b.membership.recv().await.unwrap(), MembershipEvent::Joined(NodeId::new("a")));
        assert_eq!(a.transport.members(), vec![NodeId::new("b")]);
    }

    #[tokio::test]
    async fn test_send_preserves_pair_order() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        let mut b = net.join("b");

        for election in 0..5u64 {
            a.transport
                .send(
                    &NodeId::new("b"),
                    GroupMessage::VoteResponse {
                        election,
                        verdict: crate::protocol::VoteVerdict::Granted,
                    },
                )
                .await
                .unwrap();
        }
        for expected in 0..5u64 {
            let msg = b.inbound.recv().await.unwrap();
            assert_eq!(msg.from.as_str(), "a");
            match msg.message {
                GroupMessage::VoteResponse { election, .. } => assert_eq!(election, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_to_absent_peer_fails() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        let err = a.transport.send(&NodeId::new("ghost"), heartbeat()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_crash_and_leave_events() {
        let net = MemoryNetwork::new();
        let mut a = net.join("a");
        let _b = net.join("b");
        let _c = net.join("c");
        let _ = a.membership.recv().await;
        let _ = a.membership.recv().await;

        net.crash(&NodeId::new("b"));
        assert_eq!(a.membership.recv().await.unwrap(), MembershipEvent::Suspected(NodeId::new("b")));

        net.leave(&NodeId::new("c"));
        assert_eq!(a.membership.recv().await.unwrap(), MembershipEvent::Left(NodeId::new("c")));
        assert!(a.transport.members().is_empty());
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let net = MemoryNetwork::new();
        let mut a = net.join("a");
        let b = net.join("b");
        let _ = a.membership.recv().await;

        net.partition(&NodeId::new("a"), &NodeId::new("b"));
        assert_eq!(a.membership.recv().await.unwrap(), MembershipEvent::Suspected(NodeId::new("b")));
        assert!(b.transport.send(&NodeId::new("a"), heartbeat()).await.is_err());

        net.heal(&NodeId::new("a"), &NodeId::new("b"));
        assert_eq!(a.membership.recv().await.unwrap(), MembershipEvent::Joined(NodeId::new("b")));
        assert!(b.transport.send(&NodeId::new("a"), heartbeat()).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_incarnation_cannot_send() {
        let net = MemoryNetwork::new();
        let old = net.join("a");
        let _b = net.join("b");
        net.crash(&NodeId::new("a"));
        let _new = net.join("a");

        assert!(old.transport.send(&NodeId::new("b"), heartbeat()).await.is_err());
        old.transport.shutdown().await.unwrap();
        assert!(net.is_member(&NodeId::new("a")));
    }

    #[tokio::test]
    async fn test_drop_rule_loses_messages() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        let mut b = net.join("b");
        net.set_drop_rule(|_, _, msg| matches!(msg, GroupMessage::Heartbeat { .. }));

        a.transport.send(&NodeId::new("b"), heartbeat()).await.unwrap();
        net.clear_drop_rule();
        a.transport
            .send(&NodeId::new("b"), GroupMessage::Goodbye { node: NodeId::new("a") })
            .await
            .unwrap();

        let msg = b.inbound.recv().await.unwrap();
        assert!(matches!(msg.message, GroupMessage::Goodbye { .. }));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        let mut b = net.join("b");
        let mut c = net.join("c");

        let report = a.transport.broadcast(heartbeat()).await.unwrap();
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|(_, r)| r.is_ok()));
        assert!(b.inbound.recv().await.is_some());
        assert!(c.inbound.recv().await.is_some());
    }
}
