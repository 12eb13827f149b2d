//! A reliable message transport on top of UDP, with a fire-and-forget mode on
//! the same wire format.
//!
//! ## Design goals
//!
//! * The protocol is peer-to-peer without a dedicated server vs. client
//!   * each node has one listening UDP socket that carries all connections
//!   * a connection is identified by the peer's socket address; there is at
//!     most one per peer
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data as opposed to streams of bytes)
//! * Reliable delivery when the caller asks for it: packets have sequence
//!   numbers, are acknowledged cumulatively, and are retransmitted on an
//!   adaptive timeout until acknowledged or the connection is declared dead
//! * Messages delivered on a connection arrive in the order they were sent;
//!   a lost packet blocks delivery of everything behind it until the
//!   retransmission arrives
//! * Big messages are sent without IP-level fragmentation - the transport
//!   takes care of chunking and re-assembling against a configured MTU
//!   (discovery does not work reliably)
//! * Sending adapts to both ends of the path: a sliding window bounded by the
//!   receiver's advertised buffer, combined with TCP-style congestion control
//!   (slow start, congestion avoidance, fast retransmit on three duplicate
//!   ACKs, fast recovery, full collapse on retransmission timeout)
//! * There is a reliable checksum per packet; packets that fail validation
//!   are dropped silently and recovered through retransmission
//! * A fire-and-forget mode shares the wire format for traffic where
//!   retransmission would only add latency
//!
//! ## Wire format
//!
//! Every packet starts with a fixed 32-byte header - all numbers in network
//! byte order (BE):
//!
//! ```ascii
//!  0: magic (u16): 0xBEEF
//!  2: protocol version (u8): 1
//!  3: packet type (u8): DATA 01, ACK 02, SYN 03, SYN_ACK 04, FIN 05,
//!      FIN_ACK 06, PING 07, PONG 08, FRAGMENT 09, FRAGMENT_ACK 0A,
//!      NACK 0B, RST 0C
//!  4: flags (u8): bit 0 COMPRESSED, bit 2 RELIABLE, bit 6 LAST_FRAGMENT
//!  5: sequence number (u32): position in the connection's packet stream.
//!      SYN, DATA, FIN, PING and reliable FRAGMENT packets consume sequence
//!      space; pure control packets carry 0
//!  9: ack number (u32): cumulative - an ack of N acknowledges every
//!      sequence number before N
//! 13: window (u16): the sender's free receive buffer in bytes, clamped
//! 15: checksum (u16): low 16 bits of the CRC32 over the header with this
//!      field zeroed, followed by the payload
//! 17: payload length (u32)
//! 21: fragment id (u32): random per fragmented message
//! 25: fragment index (u16)
//! 27: fragment total (u16): 0 or 1 for unfragmented packets
//! 29: 3 reserved zero bytes
//! ```
//!
//! ## Connection lifecycle
//!
//! Connections follow the TCP-style state machine: a three-way
//! SYN / SYN_ACK / ACK handshake into `Established`, a FIN handshake on
//! either side for a graceful close (`FinWait1/2`, `Closing`, `CloseWait`,
//! `LastAck`), a `TimeWait` of two maximum segment lifetimes, and RST for
//! hard teardown. Handshakes happen on demand - the first reliable send to a
//! peer establishes the connection.
//!
//! Keepalive PINGs flow on idle established connections; a connection with
//! no inbound traffic for the configured timeout is reset. Both PING and its
//! PONG carry a monotonic timestamp so keepalives double as RTT probes.
//!
//! The retransmission timeout adapts per Jacobson/Karels from RTT samples
//! (retransmitted packets are excluded per Karn's algorithm), clamped to the
//! configured bounds and backed off exponentially while losses persist.
//!
//! ## TCP variant
//!
//! The same packets can be framed onto a TCP stream with a 4-byte big-endian
//! length prefix ([`tcp_transport::TcpTransport`]). TCP brings its own
//! reliability, so the connection state machine and the window machinery are
//! not engaged there; the path exists for large, latency-tolerant messages.

pub mod config;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod fragment;
pub mod message_dispatcher;
pub mod packet;
pub mod packet_header;
pub mod send_socket;
pub mod seq;
pub mod stats;
pub mod tcp_transport;
pub mod udp_transport;

pub use config::TransportConfig;
pub use error::{DecodeError, TransportError};
pub use message_dispatcher::MessageDispatcher;
pub use tcp_transport::TcpTransport;
pub use udp_transport::UdpTransport;
