//! Datagram transport trait.
//!
//! The protocol needs nothing more than fire-and-forget datagrams: no
//! delivery guarantee, no ordering across peers. Implementations:
//! - UDP (swim-daemon)
//! - In-memory queues (simulation tests)

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Unreliable datagram transport.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Address we receive on.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Send one datagram. Success means handed to the network, not delivered.
    async fn send_to(&self, to: SocketAddr, data: &[u8]) -> Result<()>;

    /// Wait for the next datagram; returns its length and sender.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
}
