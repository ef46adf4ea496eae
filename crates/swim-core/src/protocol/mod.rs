//! Wire protocol: the datagram envelope and its binary encoding.

pub mod envelope;

pub use envelope::{
    Datagram, DirectHeader, Header, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION, Payload,
};
