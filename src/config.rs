use crate::packet_header::HEADER_SIZE;
use anyhow::bail;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration for a transport instance.
///
/// The same struct configures both the UDP transport and the TCP variant;
/// options without meaning for a given substrate (e.g. `min_rto` on TCP) are
/// simply unused there.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// The address to bind the receive socket to.
    pub host: IpAddr,
    /// The port to bind to. 0 lets the OS pick one.
    pub port: u16,

    /// The largest datagram this transport will hand to the socket. Messages
    /// whose payload does not fit into `mtu` minus the packet header are split
    /// into fragments.
    ///
    /// This is deliberately configured rather than discovered - path MTU
    /// discovery is unreliable across the networks this protocol runs on, and
    /// a wrong guess silently drops packets. Choosing it too small wastes
    /// bandwidth on header overhead.
    pub mtu: usize,

    /// Initial flow-control window in bytes, and the cap on the receive
    /// window advertised to peers.
    pub initial_window: u32,

    /// Floor for the adaptive retransmission timeout, in seconds.
    pub min_rto: f64,
    /// Ceiling for the adaptive retransmission timeout, in seconds.
    pub max_rto: f64,
    /// How often an unacknowledged packet is retransmitted before the
    /// connection is declared dead.
    pub max_retries: u32,

    /// Idle time after which an established connection sends a keepalive PING.
    pub ping_interval: Duration,
    /// Time without any inbound packet after which a connection is reset and
    /// torn down.
    pub connection_timeout: Duration,

    /// Lifetime of a partially reassembled fragmented message.
    pub reassembly_ttl: Duration,
    /// Upper bound on buffered fragment bytes per peer; the oldest reassembly
    /// is evicted when a peer exceeds it.
    pub max_reassembly_bytes_per_peer: usize,

    /// Cadence of the maintenance ticker that drives retransmissions,
    /// keepalives, idle teardown and reassembly eviction. Timer accuracy is
    /// bounded by this cadence, which is fine against a 1 s minimum RTO.
    pub maintenance_interval: Duration,
}

impl TransportConfig {
    pub fn for_port(port: u16) -> TransportConfig {
        TransportConfig {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            mtu: 1400,
            initial_window: 65535,
            min_rto: 1.0,
            max_rto: 60.0,
            max_retries: 5,
            ping_interval: Duration::from_secs(15),
            connection_timeout: Duration::from_secs(60),
            reassembly_ttl: Duration::from_secs(30),
            max_reassembly_bytes_per_peer: 16 * 1024 * 1024,
            maintenance_interval: Duration::from_millis(100),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Maximum segment size: the payload bytes that fit into one packet.
    pub fn mss(&self) -> usize {
        self.mtu - HEADER_SIZE
    }

    /// The largest message that can be expressed on the wire: the fragment
    /// total field is 16 bits wide.
    pub fn max_message_size(&self) -> usize {
        self.mss() * u16::MAX as usize
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= HEADER_SIZE + 16 {
            bail!("mtu of {} leaves no room for payload", self.mtu);
        }
        if self.min_rto <= 0.0 || self.min_rto > self.max_rto {
            bail!(
                "rto bounds are inconsistent: min {} / max {}",
                self.min_rto,
                self.max_rto
            );
        }
        if self.maintenance_interval.is_zero() {
            bail!("maintenance interval must be non-zero");
        }
        if self.initial_window == 0 {
            bail!("initial window must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::for_port(0);
        config.validate().unwrap();
        assert_eq!(config.mss(), 1368);
        assert_eq!(config.max_message_size(), 1368 * 65535);
    }

    #[test]
    fn test_rejects_tiny_mtu() {
        let mut config = TransportConfig::for_port(0);
        config.mtu = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_rto_bounds() {
        let mut config = TransportConfig::for_port(0);
        config.min_rto = 90.0;
        assert!(config.validate().is_err());
    }
}
