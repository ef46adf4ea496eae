//! NAT traversal: relayed routing through open parents and parent liveness.

pub mod messages;
pub mod relay;
pub mod sampler;

pub use messages::NatMessage;
pub use relay::{Inbound, NatConfig, NatRelay, route_inbound, route_outbound};
pub use sampler::{PeerSampler, StaticSample};
