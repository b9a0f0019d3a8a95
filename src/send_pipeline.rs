use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// Abstraction for sending a datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!(
            "UDP socket: sending packet of {} bytes to {:?}",
            packet_buf.len(),
            to
        );
        self.send_to(packet_buf, to).await?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// The context's single exit point to the wire. All outgoing datagrams of a
///  context funnel through one pipeline, which serializes nothing by itself but
///  gives tests a seam to observe or drop traffic.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        self.socket.send_packet(to, packet_buf).await
    }
}
