use crate::stats::TransportCounters;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

/// Seam between the transport and the socket: tests swap in a mock that
/// captures outbound datagrams instead of hitting the network.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        match self.send_to(packet_buf, to).await {
            Ok(written) if written < packet_buf.len() => warn!(
                "short write to {:?}: only {} of {} bytes left the socket",
                to,
                written,
                packet_buf.len()
            ),
            Ok(written) => trace!("wrote {} byte datagram to {:?}", written, to),
            // unreachable peers surface here as ICMP-driven errors;
            // retransmission handles the fallout
            Err(e) => warn!("failed to send datagram to {:?}: {}", to, e),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("bound transport socket must know its local address")
    }
}

/// The single egress point: every outbound packet goes through here so the
/// transport-level counters stay accurate.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    counters: Arc<TransportCounters>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, counters: Arc<TransportCounters>) -> SendPipeline {
        SendPipeline { socket, counters }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        self.counters.count_sent(packet_buf.len());
        self.socket.do_send_packet(to, packet_buf).await;
    }
}
