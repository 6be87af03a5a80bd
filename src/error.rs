// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the stripe coordinator.
//!
//! Errors are grouped by what the caller should do about them, exposed as
//! [`ErrorKind`] via [`CoordinatorError::kind()`]. Callers branch on the kind
//! rather than on individual variants.
//!
//! # Error Categories
//!
//! | Error Type | Kind | Description |
//! |------------|------|-------------|
//! | `Transport` | Retryable | Peer unreachable, connection reset |
//! | `Timeout` | Retryable | Send or ack did not complete in time |
//! | `SyncInterrupted` | Retryable | Sync target dropped mid-session |
//! | `Framing` | FatalToConnection | Malformed header, tear the connection down |
//! | `Codec` | FatalToConnection | Payload does not decode for its type code |
//! | `StateStore` | Fatal | Local SQLite errors (needs operator attention) |
//! | `StateCorrupt` | Fatal | Persisted cluster state unreadable |
//! | `Config` | Fatal | Configuration invalid |
//! | `Shutdown` | Fatal | Node is shutting down |
//! | `Internal` | Fatal | Unexpected internal error |
//! | `InvalidTransition` | Rejected | Edge not in the role graph |
//! | `TransitionInProgress` | Rejected | Another transition is pending |
//! | `NotActive` | Rejected | Client write sent to a non-active node |
//! | `SyncFailed` | Rejected | Sync abandoned, reported to waiters |
//!
//! A transition the failover policy refuses to approve yet is not an error:
//! it comes back as [`TransitionOutcome::Deferred`](crate::role::TransitionOutcome).

use crate::types::Role;
use crate::wire::FramingError;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Boxed async result, used at trait seams that must stay object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient. Retry with backoff or wait for a membership change.
    Retryable,
    /// The connection that produced it must be closed, never repaired in place.
    FatalToConnection,
    /// Cannot continue. Abort the operation (or startup).
    Fatal,
    /// The request itself was refused. Nothing to retry blindly.
    Rejected,
}

/// Errors that can occur while coordinating a stripe.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Peer unreachable or the connection dropped.
    #[error("Transport error ({peer_id}): {message}")]
    Transport { peer_id: String, message: String },

    /// An operation against a peer did not finish in time.
    #[error("Timed out ({operation}) waiting on {peer_id}")]
    Timeout { operation: String, peer_id: String },

    /// The sync target went away before the session finished.
    ///
    /// Units in flight are discarded on both sides and resent in full once
    /// the target rejoins.
    #[error("Sync to {target} interrupted: {message}")]
    SyncInterrupted { target: String, message: String },

    /// Malformed frame header or frame sequence.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Frame payload did not decode as the message its header announced.
    #[error("Codec error: {0}")]
    Codec(String),

    /// SQLite error while reading or writing cluster state.
    #[error("State store error: {0}")]
    StateStore(#[from] sqlx::Error),

    /// Persisted cluster state present but unusable.
    #[error("Cluster state corrupt: {0}")]
    StateCorrupt(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Edge not present in the role graph.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: Role, to: Role },

    /// Another transition is still pending for this node.
    #[error("Transition in progress: {from} -> {to}")]
    TransitionInProgress { from: Role, to: Role },

    /// Only the active serves client writes.
    #[error("Not active (current role {role})")]
    NotActive { role: Role },

    /// Sync gave up; waiters receive this.
    #[error("Sync to {target} failed: {reason}")]
    SyncFailed { target: String, reason: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn transport(peer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            peer_id: peer_id.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Retryable,
            Self::Timeout { .. } => ErrorKind::Retryable,
            Self::SyncInterrupted { .. } => ErrorKind::Retryable,
            Self::Framing(_) => ErrorKind::FatalToConnection,
            Self::Codec(_) => ErrorKind::FatalToConnection,
            Self::StateStore(_) => ErrorKind::Fatal,
            Self::StateCorrupt(_) => ErrorKind::Fatal,
            Self::Config(_) => ErrorKind::Fatal,
            Self::Shutdown => ErrorKind::Fatal,
            Self::Internal(_) => ErrorKind::Fatal,
            Self::InvalidTransition { .. } => ErrorKind::Rejected,
            Self::TransitionInProgress { .. } => ErrorKind::Rejected,
            Self::NotActive { .. } => ErrorKind::Rejected,
            Self::SyncFailed { .. } => ErrorKind::Rejected,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// Check if the connection that produced this error must be torn down
    pub fn is_fatal_to_connection(&self) -> bool {
        self.kind() == ErrorKind::FatalToConnection
    }
}

impl From<bincode::Error> for CoordinatorError {
    fn from(e: bincode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_transport() {
        let err = CoordinatorError::transport("node-2", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("node-2"));
    }

    #[test]
    fn test_is_retryable_timeout() {
        let err = CoordinatorError::timeout("ack", "node-3");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("ack"));
    }

    #[test]
    fn test_is_retryable_sync_interrupted() {
        let err = CoordinatorError::SyncInterrupted {
            target: "node-2".to_string(),
            message: "left".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Retryable);
    }

    #[test]
    fn test_framing_is_fatal_to_connection() {
        let err = CoordinatorError::from(FramingError::HeaderLength {
            declared: 40,
            expected: 24,
        });
        assert!(err.is_fatal_to_connection());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("40"));
    }

    #[test]
    fn test_codec_is_fatal_to_connection() {
        let err = CoordinatorError::Codec("unexpected end of input".to_string());
        assert!(err.is_fatal_to_connection());
    }

    #[test]
    fn test_not_retryable_config() {
        let err = CoordinatorError::Config("no servers configured".to_string());
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_rejected_transitions() {
        let err = CoordinatorError::InvalidTransition {
            from: Role::Syncing,
            to: Role::Active,
        };
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert!(err.to_string().contains("SYNCING -> ACTIVE"));

        let err = CoordinatorError::TransitionInProgress {
            from: Role::Passive,
            to: Role::Active,
        };
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert!(err.to_string().contains("in progress"));
    }

    #[test]
    fn test_not_active() {
        let err = CoordinatorError::NotActive { role: Role::Passive };
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert!(err.to_string().contains("PASSIVE"));
    }

    #[test]
    fn test_not_retryable_shutdown() {
        let err = CoordinatorError::Shutdown;
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_not_retryable_internal() {
        let err = CoordinatorError::Internal("unexpected panic".to_string());
        assert!(!err.is_retryable());
    }
}
