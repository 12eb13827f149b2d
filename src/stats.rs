use crate::connection::ConnectionState;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use rustc_hash::FxHashMap;

/// Process-lifetime counters for one transport instance. Updated from the
/// receive loop and the send pipeline, read by `stats()` snapshots.
#[derive(Default)]
pub struct TransportCounters {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub retransmissions: AtomicU64,
    pub timeouts: AtomicU64,
    pub errors: AtomicU64,
}

impl TransportCounters {
    pub fn count_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connections: FxHashMap::default(),
        }
    }
}

/// Point-in-time statistics for a transport and its connections.
#[derive(Debug, Clone)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub connections: FxHashMap<SocketAddr, ConnectionStats>,
}

/// Point-in-time statistics for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub srtt: Option<f64>,
    pub rto: f64,
    pub cwnd: usize,
    pub ssthresh: usize,
    pub bytes_in_flight: usize,
    pub receiver_window: u32,
    pub duplicate_ack_count: u32,
    pub in_fast_recovery: bool,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
    pub timeouts: u64,
    pub unacked: usize,
    pub recv_buffered: usize,
}
