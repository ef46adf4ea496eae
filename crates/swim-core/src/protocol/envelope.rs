//! Datagram envelope.
//!
//! Every datagram names its logical source and destination. When the
//! destination sits behind a NAT the envelope is wrapped for the trip through
//! a relay parent:
//!
//! ```text
//! sender --Source{inner, parent}--> parent --Relay{inner, relayed_by}--> child
//! ```
//!
//! Open destinations get a plain `Direct` header.

use crate::address::{Endpoint, NodeAddress};
use crate::error::{DecodeError, EncodeError};
use crate::nat::NatMessage;
use crate::swim::{StatusReport, SwimMessage};
use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Increment when making breaking changes to the wire format.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest datagram we accept or produce.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Logical endpoints of a message.
///
/// Addresses are full [`NodeAddress`]es so that receivers learn the sender's
/// current relay parents and parents can check they are listed for the
/// destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectHeader {
    pub source: NodeAddress,
    pub destination: NodeAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Header {
    /// Sent straight to an open destination.
    Direct(DirectHeader),
    /// Sent to `parent`, asking it to forward to a NAT-ed destination.
    Source { inner: DirectHeader, parent: Endpoint },
    /// Forwarded by parent `relayed_by` to its NAT-ed child.
    Relay {
        inner: DirectHeader,
        relayed_by: Endpoint,
    },
}

impl Header {
    /// The logical source and destination, whatever the wrapping.
    pub fn inner(&self) -> &DirectHeader {
        match self {
            Self::Direct(inner) | Self::Source { inner, .. } | Self::Relay { inner, .. } => inner,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Source { .. } => "source",
            Self::Relay { .. } => "relay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Swim(SwimMessage),
    Nat(NatMessage),
    Status(StatusReport),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Swim(msg) => msg.kind(),
            Self::Nat(msg) => msg.kind(),
            Self::Status(_) => "Status",
        }
    }
}

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datagram {
    /// Always first, so it can be checked before decoding the rest
    pub version: u16,
    pub header: Header,
    pub payload: Payload,
}

impl Datagram {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            header,
            payload,
        }
    }

    /// Serialize to bincode bytes, refusing anything over [`MAX_DATAGRAM_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let size = bincode::serialized_size(self)? as usize;
        if size > MAX_DATAGRAM_SIZE {
            return Err(EncodeError::TooLarge(size));
        }
        Ok(bincode::serialize(self)?)
    }

    /// Decode bytes received from the transport.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(DecodeError::TooLarge(data.len()));
        }
        let version: u16 = bincode::deserialize(data)?;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        Ok(bincode::deserialize(data)?)
    }
}
