//! UDP implementation of the datagram transport.

use async_trait::async_trait;
use std::net::SocketAddr;
use swim_core::transport::Result;
use swim_core::{DatagramTransport, TransportError};
use tokio::net::UdpSocket;
use tracing::info;

/// A bound UDP socket. Sends and receives may run concurrently from
/// different tasks through a shared reference.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        if let Ok(local) = socket.local_addr() {
            info!("UDP transport listening on {}", local);
        }
        Ok(Self { socket })
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))
    }

    async fn send_to(&self, to: SocketAddr, data: &[u8]) -> Result<()> {
        self.socket
            .send_to(data, to)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(format!("{to}: {e}")))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))
    }
}
