// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed group messages carried inside [`wire`](crate::wire) frames.
//!
//! Payloads are bincode. The header's type code is derived from the variant
//! on encode and cross-checked on decode: a payload that decodes as a
//! different variant than its header announced is a framing error.

use crate::error::{CoordinatorError, Result};
use crate::types::{ConcurrencyKey, EntityId, EntitySyncUnit, NodeId, Role, StripeId};
use crate::wire::{flags, FramingError, MessageHeader, MessageType};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Strength of a candidate in an election. Greater is stronger.
///
/// A node whose last committed role was ACTIVE outranks one that was not;
/// ties break towards the lower node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePriority {
    pub was_active: bool,
    pub node: NodeId,
}

impl Ord for CandidatePriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.was_active
            .cmp(&other.was_active)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for CandidatePriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Why a voter refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    /// The named node is (or the voter believes it is) the live active.
    ActiveExists(NodeId),
    /// The voter is itself a stronger candidate.
    BetterCandidate(NodeId),
    /// The voter granted someone else within the current lease.
    AlreadyVoted(NodeId),
    /// The voter is shutting down.
    Ineligible,
}

/// A voter's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteVerdict {
    Granted,
    Denied(DenyReason),
}

impl VoteVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            VoteVerdict::Granted => "granted",
            VoteVerdict::Denied(DenyReason::ActiveExists(_)) => "active_exists",
            VoteVerdict::Denied(DenyReason::BetterCandidate(_)) => "better_candidate",
            VoteVerdict::Denied(DenyReason::AlreadyVoted(_)) => "already_voted",
            VoteVerdict::Denied(DenyReason::Ineligible) => "ineligible",
        }
    }
}

/// What an ACK acknowledges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckRef {
    SyncBegin {
        session: u64,
    },
    Unit {
        session: u64,
        entity: EntityId,
        key: ConcurrencyKey,
        version: u64,
    },
    EntityEnd {
        session: u64,
        entity: EntityId,
    },
    SyncComplete {
        session: u64,
    },
    Invoke {
        entity: EntityId,
        key: ConcurrencyKey,
        version: u64,
    },
}

impl fmt::Display for AckRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckRef::SyncBegin { session } => write!(f, "sync-begin#{}", session),
            AckRef::Unit {
                session,
                entity,
                key,
                version,
            } => write!(f, "unit#{} {}/{}@{}", session, entity, key, version),
            AckRef::EntityEnd { session, entity } => write!(f, "entity-end#{} {}", session, entity),
            AckRef::SyncComplete { session } => write!(f, "sync-complete#{}", session),
            AckRef::Invoke { entity, key, version } => write!(f, "invoke {}/{}@{}", entity, key, version),
        }
    }
}

/// Every message exchanged between servers of a stripe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupMessage {
    /// First frame on every connection.
    Hello { node: NodeId, stripe_id: StripeId },
    /// Graceful departure.
    Goodbye { node: NodeId },
    Heartbeat { role: Role },
    RoleAnnounce { role: Role, stripe_id: StripeId },
    VoteRequest { election: u64, candidate: CandidatePriority },
    VoteResponse { election: u64, verdict: VoteVerdict },
    SyncBegin { session: u64, entities: u32 },
    SyncEntityBegin { session: u64, entity: EntityId, units: u32 },
    SyncEntity { session: u64, unit: EntitySyncUnit },
    SyncEntityEnd { session: u64, entity: EntityId },
    SyncComplete { session: u64 },
    Invoke { unit: EntitySyncUnit },
    Ack { ack: AckRef },
}

impl GroupMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            GroupMessage::Hello { .. } => MessageType::Hello,
            GroupMessage::Goodbye { .. } => MessageType::Goodbye,
            GroupMessage::Heartbeat { .. } => MessageType::Heartbeat,
            GroupMessage::RoleAnnounce { .. } => MessageType::RoleAnnounce,
            GroupMessage::VoteRequest { .. } => MessageType::VoteRequest,
            GroupMessage::VoteResponse { .. } => MessageType::VoteResponse,
            GroupMessage::SyncBegin { .. } => MessageType::SyncBegin,
            GroupMessage::SyncEntityBegin { .. } => MessageType::SyncEntityBegin,
            GroupMessage::SyncEntity { .. } => MessageType::SyncEntity,
            GroupMessage::SyncEntityEnd { .. } => MessageType::SyncEntityEnd,
            GroupMessage::SyncComplete { .. } => MessageType::SyncComplete,
            GroupMessage::Invoke { .. } => MessageType::Invoke,
            GroupMessage::Ack { .. } => MessageType::Ack,
        }
    }

    pub fn flags(&self) -> u16 {
        match self {
            GroupMessage::SyncBegin { .. }
            | GroupMessage::SyncEntity { .. }
            | GroupMessage::SyncEntityEnd { .. }
            | GroupMessage::SyncComplete { .. }
            | GroupMessage::Invoke { .. } => flags::REQUIRES_ACK | flags::REPLICATED,
            GroupMessage::SyncEntityBegin { .. } => flags::REPLICATED,
            _ => 0,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a payload and check it against the header that carried it.
    pub fn decode(header: &MessageHeader, payload: &[u8]) -> Result<Self> {
        let message: GroupMessage = bincode::deserialize(payload)?;
        let decoded = message.message_type();
        if decoded != header.message_type {
            return Err(CoordinatorError::Framing(FramingError::TypeMismatch {
                header: header.message_type,
                payload: decoded,
            }));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{FrameDecoder, FrameEncoder};
    use bytes::BytesMut;

    fn unit() -> EntitySyncUnit {
        EntitySyncUnit::new(EntityId::new("Map", "orders"), ConcurrencyKey(3), 7, vec![1, 2, 3])
    }

    #[test]
    fn test_priority_prefers_was_active() {
        let a = CandidatePriority {
            was_active: false,
            node: NodeId::new("a"),
        };
        let z = CandidatePriority {
            was_active: true,
            node: NodeId::new("z"),
        };
        assert!(z > a);
    }

    #[test]
    fn test_priority_prefers_lower_id() {
        let a = CandidatePriority {
            was_active: false,
            node: NodeId::new("node-1"),
        };
        let b = CandidatePriority {
            was_active: false,
            node: NodeId::new("node-2"),
        };
        assert!(a > b);
        assert_eq!(a.cmp(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn test_flags_by_type() {
        let m = GroupMessage::SyncEntity { session: 1, unit: unit() };
        assert_eq!(m.flags() & flags::REQUIRES_ACK, flags::REQUIRES_ACK);
        let m = GroupMessage::Heartbeat { role: Role::Active };
        assert_eq!(m.flags(), 0);
    }

    #[test]
    fn test_decode_through_frame() {
        let msg = GroupMessage::SyncEntity { session: 9, unit: unit() };
        let payload = msg.encode_payload().unwrap();
        let bytes = FrameEncoder::new()
            .encode(msg.message_type(), msg.flags(), &payload)
            .unwrap();

        let mut buf = BytesMut::from(&bytes[..]);
        let frame = FrameDecoder::default().decode(&mut buf).unwrap().unwrap();
        let decoded = GroupMessage::decode(&frame.header, &frame.payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_type_mismatch_is_framing_error() {
        let msg = GroupMessage::Ack {
            ack: AckRef::SyncComplete { session: 1 },
        };
        let payload = msg.encode_payload().unwrap();
        let bytes = FrameEncoder::new().encode(MessageType::Invoke, 0, &payload).unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = FrameDecoder::default().decode(&mut buf).unwrap().unwrap();

        let err = GroupMessage::decode(&frame.header, &frame.payload).unwrap_err();
        assert!(err.is_fatal_to_connection());
        assert!(err.to_string().contains("INVOKE"));
    }

    #[test]
    fn test_garbage_payload_is_codec_error() {
        let header = MessageHeader {
            message_type: MessageType::Invoke,
            flags: 0,
            total_length: 30,
            sequence: 0,
        };
        let err = GroupMessage::decode(&header, &[0xff; 6]).unwrap_err();
        assert!(err.is_fatal_to_connection());
    }

    #[test]
    fn test_ack_ref_display() {
        let ack = AckRef::Unit {
            session: 2,
            entity: EntityId::new("Map", "m"),
            key: ConcurrencyKey(1),
            version: 4,
        };
        assert_eq!(ack.to_string(), "unit#2 Map:m/1@4");
    }

    #[test]
    fn test_verdict_labels() {
        assert_eq!(VoteVerdict::Granted.label(), "granted");
        assert_eq!(
            VoteVerdict::Denied(DenyReason::AlreadyVoted(NodeId::new("x"))).label(),
            "already_voted"
        );
    }
}
