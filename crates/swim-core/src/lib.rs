//! swim-core: SWIM group membership with NAT relaying.
//!
//! This crate provides:
//! - Membership table and infection-style gossip dissemination
//! - Failure detection with direct and indirect probing
//! - Relayed routing for members behind NATs, with parent liveness tracking
//! - A versioned binary datagram envelope
//!
//! Everything is sans-IO: a [`Node`] consumes [`Input`]s and returns
//! [`Effect`]s. Runtimes (see swim-daemon) own the sockets and timers.

pub mod address;
pub mod context;
pub mod error;
pub mod nat;
pub mod node;
pub mod node_id;
pub mod protocol;
pub mod swim;
pub mod timer;
pub mod transport;

pub use address::{AddressParseError, Endpoint, NodeAddress, Reachability};
pub use error::{DecodeError, EncodeError, ProtocolViolation};
pub use node::{Effect, Input, MemberSnapshot, Node, NodeConfig, NodeSnapshot};
pub use node_id::{NodeId, NodeIdError};
pub use timer::{TimerId, TimerOp};
pub use transport::{DatagramTransport, TransportError};
