//! Per-peer circuit breakers for outbound group traffic.
//!
//! A peer that keeps refusing connections trips its circuit, and further
//! sends fail fast as transport errors until the recovery window elapses.
//! Each such failure marks the peer suspected.
//!
//! # States
//!
//! - **Closed**: sends pass through
//! - **Open**: peer unhealthy, sends fail fast
//! - **HalfOpen**: trial sends check whether the peer recovered
//!
//! # Usage
//!
//! ```rust,no_run
//! # use stripe_coordinator::circuit_breaker::{PeerCircuits, CircuitConfig, CircuitError};
//! # use stripe_coordinator::types::NodeId;
//! # async fn example() {
//! let circuits = PeerCircuits::new(CircuitConfig::default());
//! let breaker = circuits.for_peer(&NodeId::new("node-2"));
//! match breaker.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => {}
//!     Err(CircuitError::Rejected) => { /* open, peer treated as unreachable */ }
//!     Err(CircuitError::Inner(e)) => { /* send failed */ }
//! }
//! # }
//! ```

use crate::config::TransportConfig;
use crate::types::NodeId;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Rejected => None,
        }
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls observed in the closed state before the failure rate is judged.
    pub failure_threshold: u32,
    /// Trial calls allowed while half-open.
    pub success_threshold: u32,
    /// How long to stay open before allowing trial calls.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    pub fn from_transport(transport: &TransportConfig) -> Self {
        Self {
            failure_threshold: transport.circuit_failure_threshold.max(1),
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(transport.circuit_reset_timeout_sec),
        }
    }

    /// Fast recovery for testing.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Best-effort state estimate from recent accounting.
    #[must_use]
    pub fn state_estimate(&self) -> CircuitState {
        let rejections = self.rejections();
        if rejections == 0 {
            CircuitState::Closed
        } else if rejections > self.successes() {
            CircuitState::Open
        } else {
            CircuitState::HalfOpen
        }
    }
}

/// Lazily-created circuit per peer.
pub struct PeerCircuits {
    config: CircuitConfig,
    circuits: Mutex<HashMap<NodeId, Arc<CircuitBreaker>>>,
}

impl PeerCircuits {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_peer(&self, peer: &NodeId) -> Arc<CircuitBreaker> {
        let mut circuits = self.circuits.lock().unwrap_or_else(|p| p.into_inner());
        circuits
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(format!("peer:{}", peer), self.config.clone())))
            .clone()
    }

    /// Drop a peer's circuit so its next send starts closed (e.g. after it rejoined).
    pub fn reset(&self, peer: &NodeId) {
        let mut circuits = self.circuits.lock().unwrap_or_else(|p| p.into_inner());
        circuits.remove(peer);
    }
}
