//! Transport addresses of group members.
//!
//! A member is reachable either directly ("open") or only through one of its
//! relay parents ("NAT-ed"). Parents are always open endpoints.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("Invalid endpoint {0:?}: expected <id>@<ip>:<port>")]
    MissingSeparator(String),
    #[error("Invalid endpoint id: {0}")]
    InvalidId(#[from] crate::node_id::NodeIdError),
    #[error("Invalid socket address {0:?}")]
    InvalidSocket(String),
}

/// A node identity bound to the socket it listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: NodeId,
    pub socket: SocketAddr,
}

impl Endpoint {
    pub fn new(id: NodeId, socket: SocketAddr) -> Self {
        Self { id, socket }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.socket)
    }
}

impl FromStr for Endpoint {
    type Err = AddressParseError;

    /// Parse `<id>@<ip>:<port>`, e.g. `3@127.0.0.1:7003`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, socket) = s
            .split_once('@')
            .ok_or_else(|| AddressParseError::MissingSeparator(s.to_string()))?;
        let id: NodeId = id.parse()?;
        let socket: SocketAddr = socket
            .trim()
            .parse()
            .map_err(|_| AddressParseError::InvalidSocket(socket.to_string()))?;
        Ok(Self { id, socket })
    }
}

/// How a member can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reachability {
    /// Publicly reachable: send directly.
    Open,
    /// Behind a NAT: send through one of the parents.
    Nated { parents: BTreeSet<Endpoint> },
}

/// Full address of a member: its endpoint plus how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub endpoint: Endpoint,
    pub reachability: Reachability,
}

impl NodeAddress {
    /// Address of a publicly reachable node.
    pub fn open(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            reachability: Reachability::Open,
        }
    }

    /// Address of a NAT-ed node reachable through `parents`.
    pub fn nated(endpoint: Endpoint, parents: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            endpoint,
            reachability: Reachability::Nated {
                parents: parents.into_iter().collect(),
            },
        }
    }

    pub fn id(&self) -> NodeId {
        self.endpoint.id
    }

    pub fn socket(&self) -> SocketAddr {
        self.endpoint.socket
    }

    pub fn is_open(&self) -> bool {
        matches!(self.reachability, Reachability::Open)
    }

    /// Current relay parents (empty for open nodes).
    pub fn parents(&self) -> impl Iterator<Item = &Endpoint> {
        let parents = match &self.reachability {
            Reachability::Open => None,
            Reachability::Nated { parents } => Some(parents),
        };
        parents.into_iter().flatten()
    }

    /// Check whether `id` is one of this address's relay parents.
    pub fn has_parent(&self, id: NodeId) -> bool {
        self.parents().any(|p| p.id == id)
    }

    /// Copy of this address with the parent set replaced.
    ///
    /// An open address stays open.
    pub fn with_parents(&self, parents: impl IntoIterator<Item = Endpoint>) -> Self {
        match self.reachability {
            Reachability::Open => self.clone(),
            Reachability::Nated { .. } => Self::nated(self.endpoint, parents),
        }
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.reachability {
            Reachability::Open => write!(f, "{}", self.endpoint),
            Reachability::Nated { parents } => {
                write!(f, "{} [nat via", self.endpoint)?;
                for parent in parents {
                    write!(f, " {}", parent.id)?;
                }
                write!(f, "]")
            }
        }
    }
}
