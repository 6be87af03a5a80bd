//! Framed TCP group transport.
//!
//! # Connections
//!
//! Each server keeps one outbound, write-only connection per peer and
//! accepts one inbound, read-only connection from each peer. Ordering per
//! pair follows from the single outbound stream.
//!
//! ```text
//! Disconnected → Connecting → Connected
//!      ↑             ↓             ↓
//!      └─── Backoff ←┴─────────────┘
//! ```
//!
//! Outbound connections are lazy and established on first send, with
//! exponential backoff ([`RetryConfig::for_peer_send`]) behind a per-peer
//! circuit breaker. The first frame on every connection is `HELLO`.
//!
//! # Membership
//!
//! - `HELLO` on an inbound connection: peer joined
//! - `GOODBYE`: peer left
//! - EOF, I/O error, framing error or heartbeat silence: peer suspected
//!
//! A framing error (bad header, unknown type code, sequence regression,
//! payload/type mismatch) tears the connection down. It is never repaired
//! in place.

use super::{BroadcastReport, GroupTransport, Inbound, MembershipEvent, TransportEndpoint, MEMBERSHIP_CHANNEL_CAPACITY};
use crate::circuit_breaker::{CircuitConfig, CircuitError, PeerCircuits};
use crate::config::{ClusterConfig, ServerConfig, TransportConfig};
use crate::error::{BoxFuture, CoordinatorError, Result};
use crate::metrics;
use crate::protocol::GroupMessage;
use crate::resilience::{retry, RetryConfig};
use crate::types::{NodeId, Role, StripeId};
use crate::wire::{hex_preview, write_frame, FrameDecoder, FrameEncoder, HEADER_LENGTH};
use bytes::BytesMut;
use futures::future::join_all;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// State of an outbound peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    /// Connect attempts exhausted; next send starts over.
    Backoff,
}

impl PeerState {
    fn as_str(&self) -> &'static str {
        match self {
            PeerState::Disconnected => "disconnected",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Backoff => "backoff",
        }
    }
}

struct Connection {
    stream: OwnedWriteHalf,
    encoder: FrameEncoder,
}

/// Outbound link to one configured peer.
struct PeerLink {
    node: NodeId,
    server: ServerConfig,
    writer: tokio::sync::Mutex<Option<Connection>>,
    state: Mutex<PeerState>,
    /// Set when the peer was lost; the next send reconnects.
    stale: AtomicBool,
}

impl PeerLink {
    fn new(server: ServerConfig) -> Self {
        Self {
            node: server.node_id(),
            server,
            writer: tokio::sync::Mutex::new(None),
            state: Mutex::new(PeerState::Disconnected),
            stale: AtomicBool::new(false),
        }
    }

    fn set_state(&self, state: PeerState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
        metrics::record_peer_state(self.node.as_str(), state.as_str());
    }

    #[cfg(test)]
    fn state(&self) -> PeerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct LiveEntry {
    last_heard: Instant,
    connection: u64,
}

struct TcpInner {
    local: NodeId,
    stripe_id: StripeId,
    config: TransportConfig,
    links: HashMap<NodeId, Arc<PeerLink>>,
    circuits: PeerCircuits,
    inbound: mpsc::UnboundedSender<Inbound>,
    membership: broadcast::Sender<MembershipEvent>,
    live: Mutex<HashMap<NodeId, LiveEntry>>,
    /// Last role this node announced; carried by heartbeats.
    last_role: Mutex<Role>,
    next_connection: AtomicU64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// TCP implementation of [`GroupTransport`].
pub struct TcpTransport {
    inner: Arc<TcpInner>,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind the local server's configured address and start serving.
    pub async fn bind(config: &ClusterConfig) -> Result<TransportEndpoint> {
        let local = config.resolve_local_server()?;
        let addr = local.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CoordinatorError::Config(format!("cannot listen on {}: {}", addr, e)))?;
        Self::with_listener(config, listener)
    }

    /// Serve on an already bound listener.
    pub fn with_listener(config: &ClusterConfig, listener: TcpListener) -> Result<TransportEndpoint> {
        let local = config.local_node_id()?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CoordinatorError::Internal(format!("listener address: {}", e)))?;
        let transport_config = config.settings.transport.clone();

        let links = config
            .peers_of(&local)
            .map(|server| (server.node_id(), Arc::new(PeerLink::new(server.clone()))))
            .collect();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (membership_tx, membership_rx) = broadcast::channel(MEMBERSHIP_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(TcpInner {
            local: local.clone(),
            stripe_id: StripeId::new(config.stripe_name.clone()),
            circuits: PeerCircuits::new(CircuitConfig::from_transport(&transport_config)),
            config: transport_config,
            links,
            inbound: inbound_tx,
            membership: membership_tx,
            live: Mutex::new(HashMap::new()),
            last_role: Mutex::new(Role::Uninitialized),
            next_connection: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown: shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let accept = tokio::spawn(accept_loop(inner.clone(), listener, shutdown_rx.clone()));
        let heartbeat = tokio::spawn(heartbeat_loop(inner.clone(), shutdown_rx));
        inner.lock_tasks().extend([accept, heartbeat]);

        info!(node_id = %local, addr = %local_addr, peers = inner.links.len(), "TCP transport listening");

        Ok(TransportEndpoint {
            transport: Arc::new(TcpTransport { inner, local_addr }),
            inbound: inbound_rx,
            membership: membership_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl TcpInner {
    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, LiveEntry>> {
        self.live.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, event: MembershipEvent) {
        info!(node_id = %self.local, event = %event, "Membership change");
        metrics::record_membership_event(event.kind());
        let _ = self.membership.send(event);
    }

    fn mark_alive(&self, peer: &NodeId, connection: u64) {
        let newly_joined = {
            let mut live = self.lock_live();
            let previous = live.insert(
                peer.clone(),
                LiveEntry {
                    last_heard: Instant::now(),
                    connection,
                },
            );
            metrics::set_reachable_peers(live.len());
            previous.is_none()
        };
        if newly_joined {
            self.circuits.reset(peer);
            self.publish(MembershipEvent::Joined(peer.clone()));
        }
    }

    fn touch(&self, peer: &NodeId) {
        if let Some(entry) = self.lock_live().get_mut(peer) {
            entry.last_heard = Instant::now();
        }
    }

    /// Drop `peer` from the live set. With `connection`, only if that
    /// connection is still the peer's current one.
    fn lose(&self, peer: &NodeId, connection: Option<u64>, event: MembershipEvent, reason: &str) {
        let removed = {
            let mut live = self.lock_live();
            let current = live.get(peer).map(|e| e.connection);
            let matches = match (current, connection) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(c), Some(expected)) => c == expected,
            };
            if matches {
                live.remove(peer);
                metrics::set_reachable_peers(live.len());
            }
            matches
        };
        if removed {
            debug!(peer_id = %peer, reason, "Peer lost");
            if let Some(link) = self.links.get(peer) {
                link.stale.store(true, Ordering::Release);
            }
            self.publish(event);
        }
    }

    fn live_members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.lock_live().keys().cloned().collect();
        members.sort();
        members
    }

    fn note_outgoing(&self, message: &GroupMessage) {
        if let GroupMessage::RoleAnnounce { role, .. } = message {
            *self.last_role.lock().unwrap_or_else(|p| p.into_inner()) = *role;
        }
    }

    async fn connect(&self, link: &PeerLink) -> Result<Connection> {
        link.set_state(PeerState::Connecting);
        let retry_config = RetryConfig::for_peer_send(&self.config);
        let address = link.server.address();
        let peer_id = link.node.as_str();

        let stream = retry(
            &retry_config,
            "peer_connect",
            || {
                let address = address.clone();
                async move {
                    TcpStream::connect(address.as_str())
                        .await
                        .map_err(|e| CoordinatorError::transport(peer_id, e.to_string()))
                }
            },
            || CoordinatorError::timeout("connect", peer_id),
        )
        .await;

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                link.set_state(PeerState::Backoff);
                metrics::record_peer_connection(peer_id, false);
                debug!(peer_id, address = %address, error = %e, "Failed to connect to peer");
                return Err(e);
            }
        };

        let _ = stream.set_nodelay(true);
        let (_, write_half) = stream.into_split();
        let mut connection = Connection {
            stream: write_half,
            encoder: FrameEncoder::new(),
        };

        let hello = GroupMessage::Hello {
            node: self.local.clone(),
            stripe_id: self.stripe_id.clone(),
        };
        write_message(&mut connection, &hello)
            .await
            .map_err(|e| CoordinatorError::transport(peer_id, format!("hello failed: {}", e)))?;

        link.set_state(PeerState::Connected);
        link.stale.store(false, Ordering::Release);
        metrics::record_peer_connection(peer_id, true);
        info!(peer_id, address = %address, "Connected to peer");
        Ok(connection)
    }

    /// Write one message on the peer's outbound connection, connecting first
    /// if needed. A failed or timed-out write drops the connection.
    async fn deliver(&self, link: &PeerLink, message: &GroupMessage) -> Result<()> {
        let mut writer = link.writer.lock().await;
        self.deliver_locked(link, &mut writer, message).await
    }

    async fn deliver_locked(
        &self,
        link: &PeerLink,
        writer: &mut Option<Connection>,
        message: &GroupMessage,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoordinatorError::Shutdown);
        }
        if link.stale.swap(false, Ordering::AcqRel) {
            *writer = None;
        }
        if writer.is_none() {
            *writer = Some(self.connect(link).await?);
        }
        let Some(connection) = writer.as_mut() else {
            return Err(CoordinatorError::Internal("peer connection vanished".into()));
        };

        match timeout(self.config.send_timeout_duration(), write_message(connection, message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                *writer = None;
                link.set_state(PeerState::Disconnected);
                Err(CoordinatorError::transport(link.node.as_str(), e.to_string()))
            }
            Err(_) => {
                *writer = None;
                link.set_state(PeerState::Disconnected);
                Err(CoordinatorError::timeout("send", link.node.as_str()))
            }
        }
    }

    async fn send_to(&self, target: &NodeId, message: &GroupMessage) -> Result<()> {
        let link = self
            .links
            .get(target)
            .ok_or_else(|| CoordinatorError::transport(target.as_str(), "not a configured peer"))?;

        let circuit = self.circuits.for_peer(target);
        let result = match circuit.call(|| self.deliver(link, message)).await {
            Ok(()) => Ok(()),
            Err(CircuitError::Rejected) => Err(CoordinatorError::transport(target.as_str(), "circuit open")),
            Err(CircuitError::Inner(e)) => Err(e),
        };

        if let Err(e) = &result {
            metrics::record_send_failure(target.as_str());
            if !matches!(e, CoordinatorError::Shutdown) {
                self.lose(target, None, MembershipEvent::Suspected(target.clone()), "send failed");
            }
        }
        result
    }

    /// Heartbeat one peer unless its link is busy.
    async fn heartbeat(&self, link: &PeerLink, message: &GroupMessage) {
        let Ok(mut writer) = link.writer.try_lock() else {
            return;
        };
        if let Err(e) = self.deliver_locked(link, &mut writer, message).await {
            debug!(peer_id = %link.node, error = %e, "Heartbeat not delivered");
        }
    }

    fn check_silence(&self) {
        let limit = self.config.suspect_after_duration();
        let silent: Vec<NodeId> = self
            .lock_live()
            .iter()
            .filter(|(_, entry)| entry.last_heard.elapsed() > limit)
            .map(|(id, _)| id.clone())
            .collect();
        for peer in silent {
            warn!(peer_id = %peer, silence_ms = limit.as_millis() as u64, "Peer silent, suspecting");
            self.lose(&peer, None, MembershipEvent::Suspected(peer.clone()), "heartbeat silence");
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let goodbye = GroupMessage::Goodbye {
            node: self.local.clone(),
        };
        let live = self.live_members();
        let farewells = live.iter().filter_map(|peer| self.links.get(peer)).map(|link| {
            let goodbye = goodbye.clone();
            async move {
                let mut writer = link.writer.lock().await;
                if let Some(connection) = writer.as_mut() {
                    if let Err(e) = write_message(connection, &goodbye).await {
                        debug!(peer_id = %link.node, error = %e, "Goodbye not delivered");
                    }
                    let _ = connection.stream.shutdown().await;
                }
                *writer = None;
                link.set_state(PeerState::Disconnected);
            }
        });
        join_all(farewells).await;

        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.lock_live().clear();
        info!(node_id = %self.local, "TCP transport closed");
    }
}

async fn write_message(connection: &mut Connection, message: &GroupMessage) -> Result<()> {
    let payload = message.encode_payload()?;
    write_frame(
        &mut connection.stream,
        &mut connection.encoder,
        message.message_type(),
        message.flags(),
        &payload,
    )
    .await?;
    Ok(())
}

impl GroupTransport for TcpTransport {
    fn local_node(&self) -> &NodeId {
        &self.inner.local
    }

    fn send<'a>(&'a self, target: &'a NodeId, message: GroupMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.inner.note_outgoing(&message);
            self.inner.send_to(target, &message).await
        })
    }

    fn broadcast(&self, message: GroupMessage) -> BoxFuture<'_, BroadcastReport> {
        Box::pin(async move {
            self.inner.note_outgoing(&message);
            let targets = self.inner.live_members();
            let sends = targets.iter().map(|target| self.inner.send_to(target, &message));
            let results = join_all(sends).await;
            Ok(targets.into_iter().zip(results).collect())
        })
    }

    fn members(&self) -> Vec<NodeId> {
        self.inner.live_members()
    }

    fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.membership.subscribe()
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inner.close().await;
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Background tasks
// ═══════════════════════════════════════════════════════════════════════════════

async fn accept_loop(inner: Arc<TcpInner>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let connection = inner.next_connection.fetch_add(1, Ordering::Relaxed);
                    debug!(addr = %addr, connection, "Accepted inbound connection");
                    let task = tokio::spawn(read_connection(inner.clone(), stream, addr, connection, shutdown.clone()));
                    let mut tasks = inner.lock_tasks();
                    tasks.retain(|t| !t.is_finished());
                    tasks.push(task);
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

enum FrameAction {
    Continue,
    Close,
}

async fn read_connection(
    inner: Arc<TcpInner>,
    mut stream: TcpStream,
    addr: SocketAddr,
    connection: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut decoder = FrameDecoder::new(inner.config.max_frame_bytes);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut peer: Option<NodeId> = None;

    loop {
        loop {
            let header_preview = hex_preview(&buf[..buf.len().min(HEADER_LENGTH)], HEADER_LENGTH);
            match decoder.decode(&mut buf) {
                Ok(Some(frame)) => match GroupMessage::decode(&frame.header, &frame.payload) {
                    Ok(message) => {
                        if let FrameAction::Close = handle_message(&inner, &mut peer, connection, addr, message) {
                            return;
                        }
                    }
                    Err(e) => {
                        connection_failed(&inner, peer.as_ref(), connection, addr, &e.to_string(), &header_preview);
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    connection_failed(&inner, peer.as_ref(), connection, addr, &e.to_string(), &header_preview);
                    return;
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => {
                    if !buf.is_empty() {
                        let preview = hex_preview(&buf, HEADER_LENGTH);
                        connection_failed(&inner, peer.as_ref(), connection, addr, "truncated frame at EOF", &preview);
                    } else if let Some(p) = &peer {
                        inner.lose(p, Some(connection), MembershipEvent::Suspected(p.clone()), "connection closed");
                    }
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    if let Some(p) = &peer {
                        warn!(peer_id = %p, error = %e, "Inbound connection error");
                        inner.lose(p, Some(connection), MembershipEvent::Suspected(p.clone()), "read error");
                    }
                    return;
                }
            }
        }
    }
}

fn connection_failed(
    inner: &TcpInner,
    peer: Option<&NodeId>,
    connection: u64,
    addr: SocketAddr,
    reason: &str,
    header: &str,
) {
    let label = peer.map(|p| p.as_str().to_string()).unwrap_or_else(|| addr.to_string());
    error!(peer_id = %label, addr = %addr, error = reason, header, "Framing error, closing connection");
    metrics::record_framing_error(&label);
    if let Some(p) = peer {
        inner.lose(p, Some(connection), MembershipEvent::Suspected(p.clone()), "framing error");
    }
}

fn handle_message(
    inner: &TcpInner,
    peer: &mut Option<NodeId>,
    connection: u64,
    addr: SocketAddr,
    message: GroupMessage,
) -> FrameAction {
    let Some(from) = peer.clone() else {
        return match message {
            GroupMessage::Hello { node, stripe_id } => {
                if !inner.links.contains_key(&node) {
                    warn!(node_id = %node, addr = %addr, "Hello from unknown server, closing");
                    return FrameAction::Close;
                }
                if stripe_id != inner.stripe_id {
                    warn!(node_id = %node, theirs = %stripe_id, ours = %inner.stripe_id, "Hello from another stripe, closing");
                    return FrameAction::Close;
                }
                inner.mark_alive(&node, connection);
                *peer = Some(node);
                FrameAction::Continue
            }
            other => {
                warn!(addr = %addr, message_type = %other.message_type(), "First frame was not HELLO, closing");
                metrics::record_framing_error(&addr.to_string());
                FrameAction::Close
            }
        };
    };

    match message {
        GroupMessage::Hello { .. } => {
            inner.touch(&from);
            FrameAction::Continue
        }
        GroupMessage::Goodbye { .. } => {
            inner.lose(&from, None, MembershipEvent::Left(from.clone()), "goodbye");
            FrameAction::Close
        }
        GroupMessage::Heartbeat { .. } => {
            inner.mark_alive(&from, connection);
            FrameAction::Continue
        }
        message => {
            inner.mark_alive(&from, connection);
            if inner.inbound.send(Inbound { from, message }).is_err() {
                return FrameAction::Close;
            }
            FrameAction::Continue
        }
    }
}

async fn heartbeat_loop(inner: Arc<TcpInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval_duration());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let role = *inner.last_role.lock().unwrap_or_else(|p| p.into_inner());
                let message = GroupMessage::Heartbeat { role };
                for link in inner.links.values() {
                    let inner = inner.clone();
                    let link = link.clone();
                    let message = message.clone();
                    tokio::spawn(async move { inner.heartbeat(&link, &message).await });
                }
                inner.check_silence();
            }
        }
    }
    debug!("Heartbeat loop stopped");
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.inner.shutdown.send(true);
    }
}
