//! Error types for the protocol core.

use crate::NodeId;
use thiserror::Error;

/// A routing invariant was broken.
///
/// These mean the group is misconfigured (e.g. a node that believes it is
/// open is addressed as a NAT-ed child), not that the network misbehaved. The
/// node must stop rather than drop the message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("Node {local} is NAT-ed but received a source header from {source_id}")]
    SourceHeaderOnNatedNode { local: NodeId, source_id: NodeId },

    #[error("Node {local} is open but received a relay header from {source_id}")]
    RelayHeaderOnOpenNode { local: NodeId, source_id: NodeId },

    #[error("Node {local} cannot reach NAT-ed node {destination}: it has no relay parents")]
    NatedDestinationWithoutParents { local: NodeId, destination: NodeId },
}

/// An outgoing datagram could not be encoded.
///
/// The message is not sent, which the protocol sees as loss.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Datagram too large: {0} bytes")]
    TooLarge(usize),

    #[error("Failed to serialize datagram: {0}")]
    Serialize(#[from] bincode::Error),
}

/// An incoming datagram could not be decoded.
///
/// Treated like transport loss: logged and dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Datagram too large: {0} bytes")]
    TooLarge(usize),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("Malformed datagram: {0}")]
    Malformed(#[from] bincode::Error),
}
