//! Messages exchanged by the NAT relay layer.

use crate::address::Endpoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NatMessage {
    /// Liveness probe from a NAT-ed child to one of its parents.
    NatPing { seq: u64 },

    /// A parent's answer, echoing the ping's sequence.
    NatPong { seq: u64 },

    /// Ask a peer to vouch for candidate parents.
    NatRequest {
        seq: u64,
        candidates: BTreeSet<Endpoint>,
    },

    /// The candidates the peer believes alive.
    NatResponse { seq: u64, parents: BTreeSet<Endpoint> },
}

impl NatMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NatPing { .. } => "NatPing",
            Self::NatPong { .. } => "NatPong",
            Self::NatRequest { .. } => "NatRequest",
            Self::NatResponse { .. } => "NatResponse",
        }
    }
}
