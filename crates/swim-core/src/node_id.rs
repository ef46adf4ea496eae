//! NodeId: stable numeric identity of a group member.
//!
//! Membership records, piggyback entries and probe bookkeeping are all keyed
//! by `NodeId`. It stays the same when a node's transport address changes
//! (e.g. a NAT-ed node acquiring new relay parents).

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("Invalid node ID: expected a decimal number, got {0:?}")]
    InvalidFormat(String),
    #[error("Node ID 0 is reserved")]
    Zero,
}

/// A stable identifier for a node in the group.
///
/// Ordered, so that tables keyed by `NodeId` iterate deterministically
/// (round-robin probing relies on this).
///
/// # Examples
/// ```
/// use swim_core::NodeId;
///
/// let id: NodeId = "42".parse().unwrap();
/// assert_eq!(id.as_u32(), 42);
/// assert_eq!(id.to_string(), "42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Create a NodeId from a raw value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Generate a new random node ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u32 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// Get the underlying value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u32 = s
            .trim()
            .parse()
            .map_err(|_| NodeIdError::InvalidFormat(s.to_string()))?;
        if id == 0 {
            return Err(NodeIdError::Zero);
        }
        Ok(Self(id))
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> u32 {
        id.0
    }
}
