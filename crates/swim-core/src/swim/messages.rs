//! SWIM protocol message types.
//!
//! Every probe message and every reply carries a piggyback map of membership
//! updates. Messages travel inside a [`crate::protocol::Datagram`] and are
//! encoded with bincode, so enums here stay externally tagged.

use super::membership::MemberStatus;
use crate::NodeId;
use crate::address::NodeAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One piggybacked membership update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PiggybackEntry {
    /// Address of the member the update is about
    pub address: NodeAddress,
    /// Claimed status
    pub status: MemberStatus,
    /// Incarnation the claim was made at
    pub incarnation: u64,
    /// Sender's remaining budget for this entry (informational)
    pub remaining_budget: u32,
}

/// Membership updates keyed by the identity they are about.
pub type Piggyback = BTreeMap<NodeId, PiggybackEntry>;

/// SWIM failure-detection messages.
///
/// Sequence numbers identify a probe round at the node that started it, not
/// a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SwimMessage {
    /// Direct probe.
    Ping { seq: u64, piggyback: Piggyback },

    /// Reply to a direct probe.
    Pong { seq: u64, piggyback: Piggyback },

    /// Ask a helper to probe `target` on our behalf.
    PingReq {
        seq: u64,
        piggyback: Piggyback,
        target: NodeAddress,
    },

    /// Probe sent by a helper on behalf of `originator`.
    IndirectPing {
        /// The helper's own round
        seq: u64,
        piggyback: Piggyback,
        originator: NodeAddress,
        /// The originator's round
        original_seq: u64,
    },

    /// Target's reply to an indirect probe, sent to the helper.
    IndirectPong {
        /// The helper's round
        seq: u64,
        piggyback: Piggyback,
        originator: NodeAddress,
        /// The originator's round
        original_seq: u64,
    },

    /// Helper's confirmation to the originator that the target answered.
    FinalPong { seq: u64, piggyback: Piggyback },
}

impl SwimMessage {
    /// Round sequence number carried by the message.
    pub fn seq(&self) -> u64 {
        match self {
            Self::Ping { seq, .. }
            | Self::Pong { seq, .. }
            | Self::PingReq { seq, .. }
            | Self::IndirectPing { seq, .. }
            | Self::IndirectPong { seq, .. }
            | Self::FinalPong { seq, .. } => *seq,
        }
    }

    /// Piggybacked updates carried by the message.
    pub fn piggyback(&self) -> &Piggyback {
        match self {
            Self::Ping { piggyback, .. }
            | Self::Pong { piggyback, .. }
            | Self::PingReq { piggyback, .. }
            | Self::IndirectPing { piggyback, .. }
            | Self::IndirectPong { piggyback, .. }
            | Self::FinalPong { piggyback, .. } => piggyback,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
            Self::PingReq { .. } => "PingReq",
            Self::IndirectPing { .. } => "IndirectPing",
            Self::IndirectPong { .. } => "IndirectPong",
            Self::FinalPong { .. } => "FinalPong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Endpoint;
    use std::net::SocketAddr;

    fn addr(id: u32) -> NodeAddress {
        NodeAddress::open(Endpoint::new(
            NodeId::new(id),
            SocketAddr::from(([10, 0, 0, id as u8], 7000)),
        ))
    }

    #[test]
    fn test_accessors() {
        let mut piggyback = Piggyback::new();
        piggyback.insert(
            NodeId::new(3),
            PiggybackEntry {
                address: addr(3),
                status: MemberStatus::Suspected,
                incarnation: 2,
                remaining_budget: 4,
            },
        );
        let msg = SwimMessage::IndirectPing {
            seq: 11,
            piggyback,
            originator: addr(1),
            original_seq: 5,
        };

        assert_eq!(msg.seq(), 11);
        assert_eq!(msg.piggyback().len(), 1);
        assert_eq!(msg.kind(), "IndirectPing");
    }

    #[test]
    fn test_bincode_preserves_nested_addresses() {
        let msg = SwimMessage::PingReq {
            seq: 9,
            piggyback: Piggyback::new(),
            target: NodeAddress::nated(
                Endpoint::new(NodeId::new(4), SocketAddr::from(([10, 0, 0, 4], 7000))),
                [addr(2).endpoint],
            ),
        };
        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: SwimMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
