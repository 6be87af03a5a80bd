//! Core identifiers and the role model shared by every component.
//!
//! # Role lifecycle
//!
//! ```text
//!   UNINITIALIZED ─────────────────────────────┐
//!        │ (active exists)                      │ (no active, approved)
//!        ▼                                      ▼
//!   PASSIVE_UNINITIALIZED ◄──┐               ACTIVE
//!        │ (sync begins)     │ (new active)     ▲
//!        ▼                   │                  │ (promotion approved)
//!     SYNCING ───────────────┤                  │
//!        │ (sync complete)   │                  │
//!        ▼                   │                  │
//!     PASSIVE ───────────────┴──────────────────┘
//!
//!   any state ──► STOPPED (terminal)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque, stable identifier of a cluster member (the configured server name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Replication group identifier. `GroupId::NULL` means "not yet assigned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub i32);

impl GroupId {
    pub const NULL: GroupId = GroupId(-1);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stripe identifier. The empty string is the null stripe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StripeId(String);

impl StripeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn null() -> Self {
        Self(String::new())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StripeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("<null>")
        } else {
            f.write_str(&self.0)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle role of a server within its stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Just started, has not yet found its place in the stripe.
    Uninitialized,
    /// Joined a stripe with an active, waiting for sync to begin.
    PassiveUninitialized,
    /// Receiving state from the active.
    Syncing,
    /// Holds a full replica, ready for failover.
    Passive,
    /// Serves client entity requests for the stripe.
    Active,
    /// Terminal.
    Stopped,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Uninitialized,
        Role::PassiveUninitialized,
        Role::Syncing,
        Role::Passive,
        Role::Active,
        Role::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Uninitialized => "UNINITIALIZED",
            Role::PassiveUninitialized => "PASSIVE_UNINITIALIZED",
            Role::Syncing => "SYNCING",
            Role::Passive => "PASSIVE",
            Role::Active => "ACTIVE",
            Role::Stopped => "STOPPED",
        }
    }

    /// Whether `self -> to` is a legal edge of the lifecycle graph.
    pub fn can_transition_to(self, to: Role) -> bool {
        use Role::*;
        match (self, to) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Uninitialized, PassiveUninitialized) | (Uninitialized, Active) => true,
            (PassiveUninitialized, Syncing) => true,
            (Syncing, Passive) | (Syncing, PassiveUninitialized) => true,
            (Passive, Active) | (Passive, PassiveUninitialized) => true,
            _ => false,
        }
    }

    /// PASSIVE_UNINITIALIZED, SYNCING or PASSIVE.
    pub fn is_passive_family(&self) -> bool {
        matches!(self, Role::PassiveUninitialized | Role::Syncing | Role::Passive)
    }

    /// Numeric code used for gauges.
    pub fn code(&self) -> u8 {
        match self {
            Role::Uninitialized => 0,
            Role::PassiveUninitialized => 1,
            Role::Syncing => 2,
            Role::Passive => 3,
            Role::Active => 4,
            Role::Stopped => 5,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown role: {}", s))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Failover policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Failover behavior of a stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailoverPolicy {
    /// Any eligible node may promote; no votes required.
    Availability,
    /// Promotion requires `voters` affirmative votes (or proven sole survivorship).
    Consistency { voters: usize },
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        FailoverPolicy::Availability
    }
}

impl fmt::Display for FailoverPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailoverPolicy::Availability => f.write_str("AVAILABILITY"),
            FailoverPolicy::Consistency { voters } => write!(f, "CONSISTENCY({})", voters),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of a replicated entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub class_name: String,
    pub name: String,
}

impl EntityId {
    pub fn new(class_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class_name, self.name)
    }
}

/// Ordering domain inside an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConcurrencyKey(pub u32);

impl ConcurrencyKey {
    /// Big-endian 4-byte form carried in sync payload prefixes.
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ConcurrencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The atomic unit of replication: one entity, one key, one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySyncUnit {
    pub entity: EntityId,
    pub key: ConcurrencyKey,
    /// Strictly increasing per (entity, key).
    pub version: u64,
    pub payload: Vec<u8>,
}

impl EntitySyncUnit {
    pub fn new(entity: EntityId, key: ConcurrencyKey, version: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            entity,
            key,
            version,
            payload: payload.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schema version
// ═══════════════════════════════════════════════════════════════════════════════

/// `major.minor.micro` version stamped into the cluster state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl SchemaVersion {
    /// Version of the running crate.
    pub fn current() -> Self {
        Self {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            micro: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("expected major.minor.micro, got '{}'", s));
        }
        let parse = |p: &str| p.parse::<u32>().map_err(|e| format!("bad version component '{}': {}", p, e));
        Ok(Self {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            micro: parse(parts[2])?,
        })
    }
}
