use std::net::SocketAddr;
use thiserror::Error;

/// Reasons a datagram fails to decode into a packet.
///
/// All of these cause the receiver to drop the datagram silently - they never
/// reach application code and never change connection state, so the type
/// mostly shows up in logs and in codec tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("datagram shorter than the packet header")]
    Truncated,
    #[error("bad magic number {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("declared payload length {declared} but {actual} bytes present")]
    LengthMismatch { declared: u32, actual: u32 },
    #[error("checksum mismatch: header says {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { expected: u16, computed: u16 },
}

/// Errors surfaced to callers of the transport API.
///
/// Connection-level errors (`ConnectionReset`, `SendTimeout`,
/// `HandshakeTimeout`) fail every waiter on the affected connection; the
/// others are returned directly without touching transport state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection to {0} was reset")]
    ConnectionReset(SocketAddr),
    #[error("send to {0} timed out")]
    SendTimeout(SocketAddr),
    #[error("handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),
    #[error("payload of {size} bytes exceeds the maximum message size of {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("transport is closed")]
    TransportClosed,
    #[error("invalid peer address: {0}")]
    InvalidPeer(String),
}
