//! Group transport: typed messages between named servers of a stripe.
//!
//! # Contract
//!
//! - `send` resolves once the message was handed to the peer's connection,
//!   or fails with a retryable transport error. Nothing is dropped silently.
//! - Ordering holds per sender/receiver pair only.
//! - Membership changes (joined, left gracefully, suspected unreachable)
//!   are published on a broadcast channel; they are the only way transport
//!   failures reach the role state machine.
//!
//! Two implementations:
//! - [`memory::MemoryNetwork`]: in-process hub with partitions and crashes
//! - [`tcp::TcpTransport`]: framed TCP with reconnect, circuit breaker and
//!   heartbeat suspicion

pub mod memory;
pub mod tcp;

use crate::error::{BoxFuture, Result};
use crate::protocol::GroupMessage;
use crate::types::NodeId;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Capacity of the membership broadcast channel.
pub const MEMBERSHIP_CHANNEL_CAPACITY: usize = 256;

/// A change in who is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeId),
    /// Announced departure.
    Left(NodeId),
    /// Unreachable without a goodbye (crash, partition, silence).
    Suspected(NodeId),
}

impl MembershipEvent {
    pub fn node(&self) -> &NodeId {
        match self {
            MembershipEvent::Joined(n) | MembershipEvent::Left(n) | MembershipEvent::Suspected(n) => n,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MembershipEvent::Joined(_) => "joined",
            MembershipEvent::Left(_) => "left",
            MembershipEvent::Suspected(_) => "suspected",
        }
    }

    pub fn is_loss(&self) -> bool {
        !matches!(self, MembershipEvent::Joined(_))
    }
}

impl fmt::Display for MembershipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.node())
    }
}

/// A message received from a peer.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: NodeId,
    pub message: GroupMessage,
}

/// Outcome of a broadcast, per peer.
pub type BroadcastReport = Vec<(NodeId, Result<()>)>;

/// Send side of the group transport.
pub trait GroupTransport: Send + Sync {
    fn local_node(&self) -> &NodeId;

    fn send<'a>(&'a self, target: &'a NodeId, message: GroupMessage) -> BoxFuture<'a, ()>;

    /// Send to every currently reachable peer.
    fn broadcast(&self, message: GroupMessage) -> BoxFuture<'_, BroadcastReport>;

    /// Peers currently believed reachable (never includes the local node).
    fn members(&self) -> Vec<NodeId>;

    fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent>;

    /// Say goodbye to peers and stop. Further sends fail.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// Everything a node needs from its transport: the send half plus the
/// inbound queue and a membership subscription taken before any event
/// could have been published.
pub struct TransportEndpoint {
    pub transport: Arc<dyn GroupTransport>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
    pub membership: broadcast::Receiver<MembershipEvent>,
}

impl TransportEndpoint {
    pub fn local_node(&self) -> &NodeId {
        self.transport.local_node()
    }
}
