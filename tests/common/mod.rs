//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Stripe builders over the in-process harness
//! - Polling waits with a deadline
//! - A recording ReplicatedStore for apply-order assertions

#![allow(dead_code)]

pub mod recording_store;

pub use recording_store::*;

use std::future::Future;
use std::time::Duration;
use stripe_coordinator::{FailoverPolicy, HarnessStorage, InProcessCluster, NodeId};

/// Upper bound for any role change to settle in tests.
pub const SETTLE: Duration = Duration::from_secs(10);

pub fn id(name: &str) -> NodeId {
    NodeId::new(name)
}

/// Opt-in log output: `RUST_LOG=stripe_coordinator=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A started stripe of `names` with in-memory cluster state.
pub async fn started_stripe(names: &[&str], policy: FailoverPolicy) -> InProcessCluster {
    init_tracing();
    let mut cluster = InProcessCluster::new(names, policy, HarnessStorage::Memory);
    cluster.start_all().await.expect("stripe failed to start");
    cluster
}

/// Poll `check` until it holds or `timeout` passes. Returns the final verdict.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
