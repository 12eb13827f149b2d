use crate::error::TransportError;
use crate::packet::Packet;
use crate::seq::SeqNo;
use bytes::Bytes;
use rand::RngCore;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Splits messages that do not fit into a single packet into `FRAGMENT`
/// packets of exactly MSS bytes each (the last one possibly smaller).
///
/// Sequence numbers on the emitted packets are placeholders - the connection
/// layer assigns real ones at send time. The fragment id is drawn at random
/// per message; collisions are tolerable because reassemblies live only for
/// the reassembly TTL.
pub struct Fragmenter {
    mss: usize,
    max_message_size: usize,
}

impl Fragmenter {
    pub fn new(mss: usize, max_message_size: usize) -> Fragmenter {
        Fragmenter {
            mss,
            max_message_size,
        }
    }

    pub fn split(&self, payload: &[u8], reliable: bool) -> Result<Vec<Packet>, TransportError> {
        self.split_with_id(payload, reliable, rand::rng().next_u32())
    }

    pub fn split_with_id(
        &self,
        payload: &[u8],
        reliable: bool,
        fragment_id: u32,
    ) -> Result<Vec<Packet>, TransportError> {
        if payload.len() <= self.mss {
            let packet = if reliable {
                Packet::data(
                    SeqNo::ZERO,
                    SeqNo::ZERO,
                    Bytes::copy_from_slice(payload),
                    0,
                )
            } else {
                Packet::data_unreliable(Bytes::copy_from_slice(payload))
            };
            return Ok(vec![packet]);
        }

        if payload.len() > self.max_message_size {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }

        let total = payload.len().div_ceil(self.mss);
        let payload = Bytes::copy_from_slice(payload);

        let mut fragments = Vec::with_capacity(total);
        for index in 0..total {
            let start = index * self.mss;
            let end = (start + self.mss).min(payload.len());
            fragments.push(Packet::fragment(
                SeqNo::ZERO,
                fragment_id,
                index as u16,
                total as u16,
                payload.slice(start..end),
                reliable,
            ));
        }
        Ok(fragments)
    }
}

struct Reassembly {
    total: u16,
    fragments: BTreeMap<u16, Bytes>,
    buffered_bytes: usize,
    started_at: Instant,
}

/// Reassembles fragmented messages, keyed by `(sender, fragment id)`.
///
/// A reassembly is created on the first fragment, destroyed when all indices
/// are present (delivered) or when it outlives the TTL (evicted by the
/// maintenance tick). Buffered bytes are capped per peer so a misbehaving
/// sender cannot pin unbounded memory with incomplete reassemblies; the
/// peer's oldest reassembly is evicted on overflow.
pub struct Reassembler {
    ttl: Duration,
    max_bytes_per_peer: usize,
    reassemblies: FxHashMap<(SocketAddr, u32), Reassembly>,
}

impl Reassembler {
    pub fn new(ttl: Duration, max_bytes_per_peer: usize) -> Reassembler {
        Reassembler {
            ttl,
            max_bytes_per_peer,
            reassemblies: FxHashMap::default(),
        }
    }

    /// Feed one inbound packet. Returns the complete message payload when the
    /// packet was a non-fragment (immediately) or completed a reassembly.
    pub fn on_packet(&mut self, peer: SocketAddr, packet: &Packet, now: Instant) -> Option<Bytes> {
        if packet.header.fragment_total <= 1 {
            return Some(packet.payload.clone());
        }

        let total = packet.header.fragment_total;
        let index = packet.header.fragment_index;
        if index >= total {
            warn!(
                "fragment {}/{} from {:?} has index out of range - dropping",
                index, total, peer
            );
            return None;
        }

        let key = (peer, packet.header.fragment_id);
        let reassembly = self.reassemblies.entry(key).or_insert_with(|| Reassembly {
            total,
            fragments: BTreeMap::new(),
            buffered_bytes: 0,
            started_at: now,
        });

        if reassembly.total != total {
            warn!(
                "fragment id {} from {:?} declares total {} but the reassembly was started with {} - dropping the packet",
                packet.header.fragment_id, peer, total, reassembly.total
            );
            return None;
        }

        // duplicates overwrite; adjust the byte count for the replaced chunk
        if let Some(previous) = reassembly
            .fragments
            .insert(index, packet.payload.clone())
        {
            reassembly.buffered_bytes -= previous.len();
        }
        reassembly.buffered_bytes += packet.payload.len();

        if reassembly.fragments.len() == total as usize {
            let reassembly = self.reassemblies.remove(&key).expect("entry just touched");
            let mut message =
                Vec::with_capacity(reassembly.fragments.values().map(Bytes::len).sum());
            for chunk in reassembly.fragments.values() {
                message.extend_from_slice(chunk);
            }
            return Some(Bytes::from(message));
        }

        self.enforce_peer_cap(peer, key);
        None
    }

    fn enforce_peer_cap(&mut self, peer: SocketAddr, current: (SocketAddr, u32)) {
        loop {
            let peer_bytes: usize = self
                .reassemblies
                .iter()
                .filter(|((p, _), _)| *p == peer)
                .map(|(_, r)| r.buffered_bytes)
                .sum();
            if peer_bytes <= self.max_bytes_per_peer {
                return;
            }

            let oldest = self
                .reassemblies
                .iter()
                .filter(|(key, _)| key.0 == peer && **key != current)
                .min_by_key(|(_, r)| r.started_at)
                .map(|(key, _)| *key);
            let Some(oldest) = oldest else {
                // only the in-progress reassembly is left; drop it too
                self.reassemblies.remove(&current);
                debug!("peer {:?} exceeded the reassembly byte cap - dropping its reassembly", peer);
                return;
            };

            debug!(
                "peer {:?} exceeded the reassembly byte cap - evicting fragment id {}",
                peer, oldest.1
            );
            self.reassemblies.remove(&oldest);
        }
    }

    /// Drop reassemblies older than the TTL. Returns how many were evicted.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.reassemblies.len();
        self.reassemblies
            .retain(|_, r| now.duration_since(r.started_at) < ttl);
        let evicted = before - self.reassemblies.len();
        if evicted > 0 {
            debug!("evicted {} expired partial reassemblies", evicted);
        }
        evicted
    }

    pub fn pending(&self) -> usize {
        self.reassemblies.len()
    }
}
