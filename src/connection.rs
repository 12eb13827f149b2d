use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::flow_control::AdaptiveFlowController;
use crate::packet::Packet;
use crate::packet_header::PacketType;
use crate::seq::SeqNo;
use crate::stats::ConnectionStats;
use bytes::Bytes;
use rand::RngCore;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Maximum segment lifetime. A closing connection lingers in `TimeWait` for
/// twice this long so that stray retransmissions from the old incarnation
/// cannot be misread by a new one.
const MSL: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    CloseWait,
    LastAck,
    TimeWait,
}

impl ConnectionState {
    /// States in which inbound DATA may be delivered to the application.
    fn accepts_data(self) -> bool {
        !matches!(
            self,
            ConnectionState::Closed
                | ConnectionState::Listen
                | ConnectionState::SynSent
                | ConnectionState::SynRcvd
        )
    }
}

struct UnackedPacket {
    packet: Packet,
    encoded: Bytes,
    first_sent: Instant,
    last_sent: Instant,
    retries: u32,
    /// Set once the packet has been sent more than once, in which case an ACK
    /// no longer yields a usable RTT sample (Karn's algorithm).
    retransmitted: bool,
}

/// What a received packet produced: at most one response packet to send back,
/// in-order payload packets ready for reassembly/delivery, and raw packet
/// bytes to retransmit (fast retransmit, NACK).
#[derive(Default)]
pub struct HandleOutcome {
    pub response: Option<Packet>,
    pub delivered: Vec<Packet>,
    pub resend: Vec<Bytes>,
}

/// What a maintenance pass over the connection produced.
#[derive(Default)]
pub struct MaintenanceOutcome {
    pub resend: Vec<Bytes>,
    /// Set when retries were exhausted: emit this RST and drop the connection.
    pub reset: Option<Packet>,
}

#[derive(Default)]
struct ConnectionCounters {
    packets_sent: u64,
    packets_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    retransmissions: u64,
    timeouts: u64,
}

struct SendWaiter {
    last_seq: SeqNo,
    tx: oneshot::Sender<Result<(), TransportError>>,
}

/// Per-peer connection state: the handshake/teardown state machine, sequence
/// and acknowledgment bookkeeping, the unacked send buffer with adaptive
/// retransmission, the in-order delivery cursor, and the flow/congestion
/// controller.
///
/// The connection does no I/O of its own. Packet handlers return the packets
/// to send, and the owning transport serializes all access (one logical owner
/// per connection), which makes state transitions and sequence assignment
/// atomic from the connection's point of view.
pub struct Connection {
    peer_addr: SocketAddr,
    config: Arc<TransportConfig>,

    state: ConnectionState,
    send_seq: SeqNo,
    recv_seq: SeqNo,

    unacked: BTreeMap<SeqNo, UnackedPacket>,
    recv_buffer: BTreeMap<SeqNo, Packet>,
    recv_buffered_bytes: usize,

    srtt: Option<f64>,
    rttvar: f64,
    rto: f64,

    flow: AdaptiveFlowController,

    /// Epoch for the monotonic timestamps carried in PING payloads.
    created_at: Instant,
    /// Last time any packet arrived from the peer.
    last_activity: Instant,
    last_ping_sent: Option<Instant>,
    time_wait_since: Option<Instant>,

    /// The SYN_ACK we answered the peer's SYN with; replayed verbatim on a
    /// duplicate SYN so the handshake stays idempotent.
    last_syn_ack: Option<Packet>,
    /// Sequence number of our FIN, once sent; its acknowledgment drives the
    /// closing transitions.
    fin_seq: Option<SeqNo>,

    send_waiters: Vec<SendWaiter>,
    connect_waiters: Vec<oneshot::Sender<Result<(), TransportError>>>,

    counters: ConnectionCounters,
}

impl Connection {
    pub fn new(peer_addr: SocketAddr, config: Arc<TransportConfig>, now: Instant) -> Connection {
        let mss = config.mss();
        let initial_window = config.initial_window;
        let min_rto = config.min_rto;
        Connection {
            peer_addr,
            config,
            state: ConnectionState::Closed,
            send_seq: SeqNo::from_raw(rand::rng().next_u32()),
            recv_seq: SeqNo::ZERO,
            unacked: BTreeMap::new(),
            recv_buffer: BTreeMap::new(),
            recv_buffered_bytes: 0,
            srtt: None,
            rttvar: 0.0,
            rto: min_rto,
            flow: AdaptiveFlowController::new(mss, initial_window),
            created_at: now,
            last_activity: now,
            last_ping_sent: None,
            time_wait_since: None,
            last_syn_ack: None,
            fin_seq: None,
            send_waiters: Vec::new(),
            connect_waiters: Vec::new(),
            counters: ConnectionCounters::default(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Mark a connection created for an inbound SYN as passively opened.
    pub fn listen(&mut self) {
        if self.state == ConnectionState::Closed {
            self.state = ConnectionState::Listen;
        }
    }

    /// Active open: emit a SYN and move to `SynSent`. The caller transmits
    /// and tracks the returned packet.
    pub fn initiate(&mut self) -> Packet {
        debug_assert_eq!(self.state, ConnectionState::Closed);
        self.state = ConnectionState::SynSent;
        Packet::syn(self.next_seq())
    }

    /// Start a graceful close. Returns the FIN to send, or None when the
    /// state has no close transition (already closing or never opened).
    pub fn begin_close(&mut self) -> Option<Packet> {
        let next = match self.state {
            ConnectionState::Established => ConnectionState::FinWait1,
            ConnectionState::CloseWait => ConnectionState::LastAck,
            _ => return None,
        };
        self.transition(next);
        let fin = Packet::fin(self.next_seq());
        self.fin_seq = Some(fin.header.sequence);
        Some(fin)
    }

    pub fn next_seq(&mut self) -> SeqNo {
        let seq = self.send_seq;
        self.send_seq = seq.next();
        seq
    }

    /// The receive window to advertise: free buffer space, clamped to 16 bits.
    pub fn advertised_window(&self) -> u16 {
        (self.config.initial_window as usize)
            .saturating_sub(self.recv_buffered_bytes)
            .min(u16::MAX as usize) as u16
    }

    pub fn can_send(&self, bytes: usize) -> bool {
        self.flow.can_send(bytes)
    }

    /// Record an outgoing packet: bumps counters, and for packets that occupy
    /// sequence space enters them into the unacked buffer and the in-flight
    /// accounting.
    pub fn track_outgoing(&mut self, packet: &Packet, encoded: Bytes, now: Instant) {
        self.counters.packets_sent += 1;
        self.counters.bytes_sent += packet.payload_len() as u64;

        if packet.requires_ack() {
            self.flow.on_send(packet.payload_len());
            self.unacked.insert(
                packet.header.sequence,
                UnackedPacket {
                    packet: packet.clone(),
                    encoded,
                    first_sent: now,
                    last_sent: now,
                    retries: 0,
                    retransmitted: false,
                },
            );
        }
    }

    /// Wait for the cumulative acknowledgment of `last_seq`.
    pub fn register_send_waiter(
        &mut self,
        last_seq: SeqNo,
    ) -> oneshot::Receiver<Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.send_waiters.push(SendWaiter { last_seq, tx });
        rx
    }

    /// Wait for the connection to reach `Established`.
    pub fn register_connect_waiter(&mut self) -> oneshot::Receiver<Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.connect_waiters.push(tx);
        rx
    }

    /// Fail every waiter and close the connection.
    pub fn abort(&mut self, error: TransportError) {
        for waiter in self.send_waiters.drain(..) {
            let _ = waiter.tx.send(Err(error.clone()));
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        self.unacked.clear();
        self.transition(ConnectionState::Closed);
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(
                "connection {:?}: {:?} -> {:?}",
                self.peer_addr, self.state, next
            );
            self.state = next;
            if next == ConnectionState::TimeWait {
                self.time_wait_since = Some(self.last_activity);
            }
            if next == ConnectionState::Established {
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
    }

    /// Process one validated inbound packet.
    pub fn handle_packet(&mut self, packet: Packet, now: Instant) -> HandleOutcome {
        self.last_activity = now;
        self.counters.packets_received += 1;
        self.counters.bytes_received += packet.payload_len() as u64;

        let mut outcome = match packet.header.packet_type {
            PacketType::Syn => self.handle_syn(&packet),
            PacketType::SynAck => self.handle_syn_ack(&packet, now),
            PacketType::Ack | PacketType::FinAck => self.handle_ack(&packet, now),
            PacketType::Data | PacketType::Fragment => self.handle_data(packet, now),
            PacketType::Fin => self.handle_fin(&packet),
            PacketType::Ping => self.handle_ping(packet, now),
            PacketType::Pong => self.handle_pong(&packet, now),
            PacketType::Nack => self.handle_nack(&packet, now),
            PacketType::FragmentAck => {
                trace!(
                    "peer {:?} completed reassembly of fragment id {}",
                    self.peer_addr,
                    packet.header.fragment_id
                );
                HandleOutcome::default()
            }
            PacketType::Rst => {
                debug!("connection {:?} reset by peer", self.peer_addr);
                self.abort(TransportError::ConnectionReset(self.peer_addr));
                HandleOutcome::default()
            }
        };

        // every response advertises the current receive window
        if let Some(response) = &mut outcome.response {
            response.header.window = self.advertised_window();
        }
        outcome
    }

    fn handle_syn(&mut self, packet: &Packet) -> HandleOutcome {
        match self.state {
            ConnectionState::Closed | ConnectionState::Listen => {
                self.recv_seq = packet.header.sequence.next();
                self.transition(ConnectionState::SynRcvd);
                let syn_ack = Packet::syn_ack(self.next_seq(), self.recv_seq);
                self.last_syn_ack = Some(syn_ack.clone());
                HandleOutcome {
                    response: Some(syn_ack),
                    ..Default::default()
                }
            }
            ConnectionState::SynRcvd => {
                // our SYN_ACK got lost: repeat it without consuming sequence space
                debug!("duplicate SYN from {:?} - repeating SYN_ACK", self.peer_addr);
                HandleOutcome {
                    response: self.last_syn_ack.clone(),
                    ..Default::default()
                }
            }
            _ => {
                debug!(
                    "ignoring SYN from {:?} in state {:?}",
                    self.peer_addr, self.state
                );
                HandleOutcome::default()
            }
        }
    }

    fn handle_syn_ack(&mut self, packet: &Packet, now: Instant) -> HandleOutcome {
        match self.state {
            ConnectionState::SynSent => {
                self.recv_seq = packet.header.sequence.next();
                let mut outcome = HandleOutcome::default();
                self.process_ack(packet.header.ack, packet.header.window, now, None, &mut outcome);
                self.transition(ConnectionState::Established);
                outcome.response = Some(Packet::ack(self.recv_seq, 0));
                outcome
            }
            ConnectionState::Established => {
                // our handshake ACK got lost; the peer is still waiting for it
                HandleOutcome {
                    response: Some(Packet::ack(self.recv_seq, 0)),
                    ..Default::default()
                }
            }
            _ => HandleOutcome::default(),
        }
    }

    fn handle_ack(&mut self, packet: &Packet, now: Instant) -> HandleOutcome {
        let mut outcome = HandleOutcome::default();
        self.process_ack(packet.header.ack, packet.header.window, now, None, &mut outcome);
        outcome
    }

    /// Cumulative acknowledgment processing shared by ACK, SYN_ACK, FIN_ACK
    /// and PONG. An ACK of N acknowledges every sequence number before N.
    fn process_ack(
        &mut self,
        ack: SeqNo,
        window: u16,
        now: Instant,
        rtt_override: Option<f64>,
        outcome: &mut HandleOutcome,
    ) {
        let acked: Vec<SeqNo> = self
            .unacked
            .keys()
            .copied()
            .filter(|seq| seq.before(ack))
            .collect();

        if acked.is_empty() {
            if !self.unacked.is_empty() {
                // nothing new - a duplicate of the last cumulative ack
                if self.flow.on_duplicate_ack(ack, window as u32) {
                    self.fast_retransmit(ack, now, outcome);
                }
            }
            return;
        }

        let mut acked_bytes = 0;
        let mut rtt_sample = rtt_override;
        for seq in acked {
            let entry = self.unacked.remove(&seq).expect("key just listed");
            acked_bytes += entry.packet.payload_len();
            if rtt_sample.is_none() && !entry.retransmitted {
                rtt_sample = Some(now.duration_since(entry.first_sent).as_secs_f64());
            }
        }

        if let Some(rtt) = rtt_sample {
            self.update_rtt(rtt);
        }
        self.flow.on_ack(ack, acked_bytes, window as u32);

        // complete reliable sends whose final packet is now covered
        let mut i = 0;
        while i < self.send_waiters.len() {
            if self.send_waiters[i].last_seq.before(ack) {
                let waiter = self.send_waiters.swap_remove(i);
                let _ = waiter.tx.send(Ok(()));
            } else {
                i += 1;
            }
        }

        match self.state {
            ConnectionState::SynRcvd => self.transition(ConnectionState::Established),
            ConnectionState::FinWait1 if self.fin_acked(ack) => {
                self.transition(ConnectionState::FinWait2)
            }
            ConnectionState::Closing if self.fin_acked(ack) => {
                self.transition(ConnectionState::TimeWait)
            }
            ConnectionState::LastAck if self.fin_acked(ack) => {
                self.transition(ConnectionState::Closed)
            }
            _ => {}
        }
    }

    fn fin_acked(&self, ack: SeqNo) -> bool {
        self.fin_seq.is_some_and(|fin| fin.before(ack))
    }

    fn fast_retransmit(&mut self, ack: SeqNo, now: Instant, outcome: &mut HandleOutcome) {
        let Some(entry) = self.unacked.get_mut(&ack) else {
            debug!(
                "fast retransmit requested for {} but it is not in the send buffer",
                ack
            );
            return;
        };
        debug!("fast retransmit of {} to {:?}", ack, self.peer_addr);
        entry.last_sent = now;
        entry.retransmitted = true;
        self.counters.retransmissions += 1;
        outcome.resend.push(entry.encoded.clone());
    }

    fn handle_data(&mut self, packet: Packet, now: Instant) -> HandleOutcome {
        if !self.state.accepts_data() {
            debug!(
                "dropping data from {:?} in state {:?}",
                self.peer_addr, self.state
            );
            return HandleOutcome::default();
        }
        self.accept_sequenced(packet, now, true)
    }

    /// In-order acceptance shared by DATA, FRAGMENT and PING - all of them
    /// occupy sequence space. `deliver` controls whether in-order packets are
    /// surfaced to the application (PINGs are not).
    fn accept_sequenced(&mut self, packet: Packet, _now: Instant, deliver: bool) -> HandleOutcome {
        let mut outcome = HandleOutcome::default();
        let seq = packet.header.sequence;
        let gap = seq.distance(self.recv_seq);

        if gap == 0 {
            self.recv_seq = self.recv_seq.next();
            if deliver {
                outcome.delivered.push(packet);
            }
            // the gap is closed - drain whatever queued up behind it
            while let Some(buffered) = self.recv_buffer.remove(&self.recv_seq) {
                self.recv_buffered_bytes -= buffered.payload_len();
                self.recv_seq = self.recv_seq.next();
                if buffered.header.packet_type != PacketType::Ping {
                    outcome.delivered.push(buffered);
                }
            }
        } else if gap < 0 {
            // duplicate of something already delivered; the ack below tells
            // the peer where we really are
            trace!("duplicate packet {} from {:?}", seq, self.peer_addr);
        } else if gap as usize <= self.max_recv_ahead() {
            trace!(
                "buffering out-of-order packet {} from {:?} (expecting {})",
                seq,
                self.peer_addr,
                self.recv_seq
            );
            if let std::collections::btree_map::Entry::Vacant(e) = self.recv_buffer.entry(seq) {
                self.recv_buffered_bytes += packet.payload_len();
                e.insert(packet);
            }
        } else {
            warn!(
                "packet {} from {:?} is {} ahead of the receive window - dropping",
                seq, self.peer_addr, gap
            );
            return outcome;
        }

        outcome.response = Some(Packet::ack(self.recv_seq, 0));
        outcome
    }

    /// How many packets ahead of the delivery cursor the receive buffer
    /// accepts.
    fn max_recv_ahead(&self) -> usize {
        (self.config.initial_window as usize / self.config.mss()).max(1)
    }

    /// A FIN is acknowledged with a typed FIN_ACK; its ack field is cumulative
    /// like any other, so the peer's ack processing needs no special case.
    fn handle_fin(&mut self, packet: &Packet) -> HandleOutcome {
        self.recv_seq = packet.header.sequence.next();
        match self.state {
            ConnectionState::Established => self.transition(ConnectionState::CloseWait),
            ConnectionState::FinWait1 => self.transition(ConnectionState::Closing),
            ConnectionState::FinWait2 => self.transition(ConnectionState::TimeWait),
            // duplicate FIN in a closing state: just re-ack
            _ => {}
        }
        HandleOutcome {
            response: Some(Packet::fin_ack(self.recv_seq, 0)),
            ..Default::default()
        }
    }

    fn handle_ping(&mut self, packet: Packet, now: Instant) -> HandleOutcome {
        if !self.state.accepts_data() {
            return HandleOutcome::default();
        }
        let echoed = packet.payload.clone();
        // the ping occupies sequence space like data, but is never delivered
        let mut outcome = self.accept_sequenced(packet, now, false);
        outcome.response = Some(Packet::pong(self.recv_seq, echoed));
        outcome
    }

    fn handle_pong(&mut self, packet: &Packet, now: Instant) -> HandleOutcome {
        // the echoed timestamp identifies the exact transmission it answers,
        // so it stays a valid RTT sample even for a retransmitted ping
        let rtt_override = if packet.payload.len() == 8 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&packet.payload);
            let sent_at = f64::from_be_bytes(raw);
            let elapsed = self.clock_seconds(now) - sent_at;
            (elapsed >= 0.0).then_some(elapsed)
        } else {
            None
        };

        let mut outcome = HandleOutcome::default();
        self.process_ack(
            packet.header.ack,
            packet.header.window,
            now,
            rtt_override,
            &mut outcome,
        );
        outcome
    }

    fn handle_nack(&mut self, packet: &Packet, now: Instant) -> HandleOutcome {
        let mut outcome = HandleOutcome::default();
        let requested = packet.header.ack;
        if let Some(entry) = self.unacked.get_mut(&requested) {
            debug!(
                "resending {} to {:?} on explicit request",
                requested, self.peer_addr
            );
            entry.last_sent = now;
            entry.retransmitted = true;
            self.counters.retransmissions += 1;
            outcome.resend.push(entry.encoded.clone());
        } else {
            debug!(
                "peer {:?} requested retransmission of {} which is no longer buffered",
                self.peer_addr, requested
            );
        }
        outcome
    }

    /// Jacobson/Karels smoothing; the result is clamped into the configured
    /// RTO bounds.
    fn update_rtt(&mut self, rtt: f64) {
        let srtt = match self.srtt {
            None => {
                self.rttvar = rtt / 2.0;
                rtt
            }
            Some(srtt) => {
                self.rttvar = 0.75 * self.rttvar + 0.25 * (srtt - rtt).abs();
                0.875 * srtt + 0.125 * rtt
            }
        };
        self.srtt = Some(srtt);
        self.rto = (srtt + 4.0 * self.rttvar).clamp(self.config.min_rto, self.config.max_rto);
        trace!("rtt sample {:.4}s -> srtt {:.4}s rto {:.4}s", rtt, srtt, self.rto);
    }

    /// Seconds on this connection's monotonic clock, as carried in PINGs.
    pub fn clock_seconds(&self, now: Instant) -> f64 {
        now.duration_since(self.created_at).as_secs_f64()
    }

    /// Emit a keepalive probe. Consumes a sequence number; the caller tracks
    /// and transmits it like any reliable packet.
    pub fn make_ping(&mut self, now: Instant) -> Packet {
        self.last_ping_sent = Some(now);
        Packet::ping(self.next_seq(), self.clock_seconds(now))
    }

    pub fn keepalive_due(&self, now: Instant) -> bool {
        self.state == ConnectionState::Established
            && now.duration_since(self.last_activity) > self.config.ping_interval
            && self
                .last_ping_sent
                .is_none_or(|sent| now.duration_since(sent) > self.config.ping_interval)
    }

    pub fn idle_expired(&self, now: Instant) -> bool {
        self.state != ConnectionState::Closed
            && now.duration_since(self.last_activity) > self.config.connection_timeout
    }

    /// Time since the peer was last heard from.
    pub fn quiet_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }

    /// `TimeWait` ends after two maximum segment lifetimes.
    pub fn time_wait_expired(&mut self, now: Instant) -> bool {
        if self.state != ConnectionState::TimeWait {
            return false;
        }
        let expired = self
            .time_wait_since
            .is_some_and(|since| now.duration_since(since) >= 2 * MSL);
        if expired {
            self.transition(ConnectionState::Closed);
        }
        expired
    }

    /// One retransmission pass: resend every unacked packet whose RTO has
    /// elapsed, backing the RTO off exponentially. When a packet has exhausted
    /// its retries the connection is torn down - all waiters fail with
    /// `SendTimeout` and the peer gets an RST.
    pub fn scan_retransmissions(&mut self, now: Instant) -> MaintenanceOutcome {
        let mut outcome = MaintenanceOutcome::default();
        let rto = Duration::from_secs_f64(self.rto);

        let due: Vec<SeqNo> = self
            .unacked
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_sent) > rto)
            .map(|(seq, _)| *seq)
            .collect();
        if due.is_empty() {
            return outcome;
        }

        for seq in due {
            let entry = self.unacked.get_mut(&seq).expect("key just listed");
            if entry.retries >= self.config.max_retries {
                warn!(
                    "packet {} to {:?} exhausted {} retries - resetting connection",
                    seq, self.peer_addr, entry.retries
                );
                self.unacked.remove(&seq);
                self.abort(TransportError::SendTimeout(self.peer_addr));
                outcome.reset = Some(Packet::rst());
                return outcome;
            }

            trace!(
                "retransmitting {} to {:?} (retry {})",
                seq,
                self.peer_addr,
                entry.retries + 1
            );
            entry.retries += 1;
            entry.retransmitted = true;
            entry.last_sent = now;
            self.counters.retransmissions += 1;
            outcome.resend.push(entry.encoded.clone());
        }

        // one backoff step and one loss signal per pass, however many packets
        // expired together
        self.counters.timeouts += 1;
        self.rto = (self.rto * 2.0).min(self.config.max_rto);
        self.flow.on_timeout();

        outcome
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state,
            srtt: self.srtt,
            rto: self.rto,
            cwnd: self.flow.cwnd(),
            ssthresh: self.flow.ssthresh(),
            bytes_in_flight: self.flow.bytes_in_flight(),
            receiver_window: self.flow.receiver_window(),
            duplicate_ack_count: self.flow.duplicate_ack_count(),
            in_fast_recovery: self.flow.in_fast_recovery(),
            packets_sent: self.counters.packets_sent,
            packets_received: self.counters.packets_received,
            bytes_sent: self.counters.bytes_sent,
            bytes_received: self.counters.bytes_received,
            retransmissions: self.counters.retransmissions,
            timeouts: self.counters.timeouts,
            unacked: self.unacked.len(),
            recv_buffered: self.recv_buffer.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> Arc<TransportConfig> {
        Arc::new(TransportConfig::for_port(0))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn connection(initial_seq: u32, now: Instant) -> Connection {
        let mut conn = Connection::new(addr(9001), config(), now);
        conn.send_seq = SeqNo::from_raw(initial_seq);
        conn
    }

    /// Runs the three-way handshake between two fresh connections and returns
    /// them established. `a` actively opened with initial sequence 1000, `b`
    /// passively with 5000.
    fn established_pair(now: Instant) -> (Connection, Connection) {
        let mut a = connection(1000, now);
        let mut b = connection(5000, now);
        b.listen();

        let syn = a.initiate();
        a.track_outgoing(&syn, syn.encode(), now);

        let syn_ack = b.handle_packet(syn, now).response.unwrap();
        b.track_outgoing(&syn_ack, syn_ack.encode(), now);

        let ack = a.handle_packet(syn_ack, now).response.unwrap();
        assert!(a.is_established());

        assert!(b.handle_packet(ack, now).response.is_none());
        assert!(b.is_established());

        (a, b)
    }

    /// Sends `payload` from `from` and delivers the data packet to `to`,
    /// returning the receiver's outcome.
    fn send_data(
        from: &mut Connection,
        to: &mut Connection,
        payload: &[u8],
        now: Instant,
    ) -> HandleOutcome {
        let packet = Packet::data(
            from.next_seq(),
            SeqNo::ZERO,
            Bytes::copy_from_slice(payload),
            from.advertised_window(),
        );
        from.track_outgoing(&packet, packet.encode(), now);
        to.handle_packet(packet, now)
    }

    #[test]
    fn test_handshake() {
        let now = Instant::now();
        let (a, b) = established_pair(now);

        // a's SYN consumed 1000, its pure ACK consumed nothing
        assert_eq!(a.send_seq, SeqNo::from_raw(1001));
        assert_eq!(b.recv_seq, SeqNo::from_raw(1001));
        // b's SYN_ACK consumed 5000
        assert_eq!(b.send_seq, SeqNo::from_raw(5001));
        assert_eq!(a.recv_seq, SeqNo::from_raw(5001));

        // both sides cleared their handshake packets from the send buffer
        assert!(a.unacked.is_empty());
        assert!(b.unacked.is_empty());
    }

    #[test]
    fn test_connect_waiter_completes_on_establishment() {
        let now = Instant::now();
        let mut a = connection(1000, now);
        let syn = a.initiate();
        a.track_outgoing(&syn, syn.encode(), now);
        let mut rx = a.register_connect_waiter();
        assert!(rx.try_recv().is_err());

        let syn_ack = Packet::syn_ack(SeqNo::from_raw(7000), SeqNo::from_raw(1001));
        a.handle_packet(syn_ack, now);

        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_duplicate_syn_repeats_syn_ack() {
        let now = Instant::now();
        let mut b = connection(5000, now);
        b.listen();

        let first = b
            .handle_packet(Packet::syn(SeqNo::from_raw(1000)), now)
            .response
            .unwrap();
        let second = b
            .handle_packet(Packet::syn(SeqNo::from_raw(1000)), now)
            .response
            .unwrap();

        assert_eq!(first.header.sequence, second.header.sequence);
        assert_eq!(first.header.ack, second.header.ack);
        // the replay did not consume fresh sequence space
        assert_eq!(b.send_seq, SeqNo::from_raw(5001));
    }

    #[test]
    fn test_in_order_data_is_delivered_and_acked() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        let outcome = send_data(&mut a, &mut b, b"hello", now);

        assert_eq!(outcome.delivered.len(), 1);
        assert_eq!(outcome.delivered[0].payload.as_ref(), b"hello");

        let ack = outcome.response.unwrap();
        assert_eq!(ack.header.packet_type, PacketType::Ack);
        assert_eq!(ack.header.ack, SeqNo::from_raw(1002));
        assert!(ack.header.window > 0);
    }

    #[test]
    fn test_out_of_order_data_is_buffered_until_gap_fills() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        let p1 = Packet::data(a.next_seq(), SeqNo::ZERO, Bytes::from_static(b"one"), 0);
        let p2 = Packet::data(a.next_seq(), SeqNo::ZERO, Bytes::from_static(b"two"), 0);
        let p3 = Packet::data(a.next_seq(), SeqNo::ZERO, Bytes::from_static(b"three"), 0);

        // deliver 2 and 3 first: buffered, acks repeat the expected sequence
        let outcome = b.handle_packet(p2, now);
        assert!(outcome.delivered.is_empty());
        assert_eq!(outcome.response.unwrap().header.ack, SeqNo::from_raw(1001));

        let outcome = b.handle_packet(p3, now);
        assert!(outcome.delivered.is_empty());
        assert_eq!(outcome.response.unwrap().header.ack, SeqNo::from_raw(1001));
        assert_eq!(b.recv_buffer.len(), 2);

        // the gap fills: everything drains in order
        let outcome = b.handle_packet(p1, now);
        let payloads: Vec<&[u8]> = outcome.delivered.iter().map(|p| p.payload.as_ref()).collect();
        assert_eq!(payloads, vec![b"one".as_ref(), b"two".as_ref(), b"three".as_ref()]);
        assert_eq!(outcome.response.unwrap().header.ack, SeqNo::from_raw(1004));
        assert!(b.recv_buffer.is_empty());
    }

    #[test]
    fn test_duplicate_data_is_dropped_but_acked() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        send_data(&mut a, &mut b, b"payload", now);

        // the same packet again: no second delivery, but a fresh ACK
        let dup = Packet::data(
            SeqNo::from_raw(1001),
            SeqNo::ZERO,
            Bytes::from_static(b"payload"),
            0,
        );
        let outcome = b.handle_packet(dup, now);
        assert!(outcome.delivered.is_empty());
        assert_eq!(outcome.response.unwrap().header.ack, SeqNo::from_raw(1002));
    }

    #[test]
    fn test_data_far_ahead_of_window_is_dropped_silently() {
        let now = Instant::now();
        let (_, mut b) = established_pair(now);

        let far = Packet::data(
            SeqNo::from_raw(1001 + 10_000),
            SeqNo::ZERO,
            Bytes::from_static(b"x"),
            0,
        );
        let outcome = b.handle_packet(far, now);
        assert!(outcome.delivered.is_empty());
        assert!(outcome.response.is_none());
        assert!(b.recv_buffer.is_empty());
    }

    #[test]
    fn test_data_before_establishment_is_not_delivered() {
        let now = Instant::now();
        let mut b = connection(5000, now);
        b.listen();
        b.handle_packet(Packet::syn(SeqNo::from_raw(1000)), now);
        assert_eq!(b.state(), ConnectionState::SynRcvd);

        let premature = Packet::data(SeqNo::from_raw(1001), SeqNo::ZERO, Bytes::from_static(b"x"), 0);
        let outcome = b.handle_packet(premature, now);
        assert!(outcome.delivered.is_empty());
        assert!(outcome.response.is_none());
    }

    #[test]
    fn test_cumulative_ack_clears_unacked_and_completes_waiter() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        send_data(&mut a, &mut b, b"first", now);
        send_data(&mut a, &mut b, b"second", now);
        let outcome = send_data(&mut a, &mut b, b"third", now);
        assert_eq!(a.unacked.len(), 3);

        let mut rx = a.register_send_waiter(SeqNo::from_raw(1003));

        // the final cumulative ACK covers all three
        a.handle_packet(outcome.response.unwrap(), now);
        assert!(a.unacked.is_empty());
        assert_eq!(a.flow.bytes_in_flight(), 0);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_rtt_estimation() {
        let start = Instant::now();
        let (mut a, mut b) = established_pair(start);

        let outcome = send_data(&mut a, &mut b, b"ping me", start);
        let ack_time = start + Duration::from_millis(100);
        a.handle_packet(outcome.response.unwrap(), ack_time);

        // first sample: srtt = rtt, rttvar = rtt/2, rto clamped to min_rto
        let srtt = a.srtt.unwrap();
        assert!((srtt - 0.1).abs() < 1e-6);
        assert!((a.rttvar - 0.05).abs() < 1e-6);
        assert!((a.rto - 1.0).abs() < 1e-9);

        // second sample of 300ms follows Jacobson/Karels
        let outcome = send_data(&mut a, &mut b, b"again", ack_time);
        a.handle_packet(outcome.response.unwrap(), ack_time + Duration::from_millis(300));

        let expected_rttvar = 0.75 * 0.05 + 0.25 * (0.1f64 - 0.3).abs();
        let expected_srtt = 0.875 * 0.1 + 0.125 * 0.3;
        assert!((a.rttvar - expected_rttvar).abs() < 1e-6);
        assert!((a.srtt.unwrap() - expected_srtt).abs() < 1e-6);
        assert!((a.rto - 1.0).abs() < 1e-9); // still below the floor
    }

    #[test]
    fn test_retransmission_uses_karn_rule() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        let outcome = send_data(&mut a, &mut b, b"lost once", now);

        // the packet is retransmitted, so its eventual ack gives no sample
        let later = now + Duration::from_millis(1100);
        let maintenance = a.scan_retransmissions(later);
        assert_eq!(maintenance.resend.len(), 1);

        a.handle_packet(outcome.response.unwrap(), later + Duration::from_millis(100));
        assert!(a.srtt.is_none());
    }

    #[test]
    fn test_retransmission_backoff_doubles_rto() {
        let mut now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        send_data(&mut a, &mut b, b"into the void", now);

        let mut expected_rto = 1.0;
        for retry in 1..=5 {
            now += Duration::from_secs_f64(expected_rto) + Duration::from_millis(50);
            let maintenance = a.scan_retransmissions(now);
            assert_eq!(maintenance.resend.len(), 1, "retry {}", retry);
            assert!(maintenance.reset.is_none());
            expected_rto = (expected_rto * 2.0).min(60.0);
            assert!((a.rto - expected_rto).abs() < 1e-9);
        }

        // timeout collapsed the congestion window to one segment
        assert_eq!(a.stats().cwnd, a.config.mss());
    }

    #[test]
    fn test_exhausted_retries_reset_the_connection() {
        let mut now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        send_data(&mut a, &mut b, b"never acked", now);
        let mut rx = a.register_send_waiter(SeqNo::from_raw(1001));

        for _ in 0..5 {
            now += Duration::from_secs_f64(a.rto) + Duration::from_millis(50);
            assert!(a.scan_retransmissions(now).reset.is_none());
        }

        now += Duration::from_secs_f64(a.rto) + Duration::from_millis(50);
        let maintenance = a.scan_retransmissions(now);
        let reset = maintenance.reset.unwrap();
        assert_eq!(reset.header.packet_type, PacketType::Rst);
        assert!(a.is_closed());
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(TransportError::SendTimeout(addr(9001)))
        );
    }

    #[test]
    fn test_three_duplicate_acks_trigger_fast_retransmit() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        // ten packets in flight; grow cwnd first so halving is observable
        for i in 0..10 {
            let outcome = send_data(&mut a, &mut b, format!("packet {}", i).as_bytes(), now);
            if i < 3 {
                // feed the acks for the first three back to the sender
                a.handle_packet(outcome.response.unwrap(), now);
            }
        }
        assert_eq!(a.unacked.len(), 7);
        let cwnd_before = a.stats().cwnd;

        // three duplicate acks stuck at the first unacked sequence (1004)
        let stuck = SeqNo::from_raw(1004);
        assert!(a.handle_packet(Packet::ack(stuck, 65535), now).resend.is_empty());
        assert!(a.handle_packet(Packet::ack(stuck, 65535), now).resend.is_empty());
        let outcome = a.handle_packet(Packet::ack(stuck, 65535), now);

        assert_eq!(outcome.resend.len(), 1);
        let resent = Packet::decode(&outcome.resend[0]).unwrap();
        assert_eq!(resent.header.sequence, stuck);

        let stats = a.stats();
        assert!(stats.in_fast_recovery);
        assert!(stats.cwnd < cwnd_before + 4 * a.config.mss());
        assert_eq!(stats.ssthresh, (cwnd_before / 2).max(2 * a.config.mss()));
        assert_eq!(stats.retransmissions, 1);
    }

    #[test]
    fn test_nack_resends_immediately() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        send_data(&mut a, &mut b, b"requested again", now);

        let outcome = a.handle_packet(Packet::nack(SeqNo::from_raw(1001)), now);
        assert_eq!(outcome.resend.len(), 1);
        assert_eq!(
            Packet::decode(&outcome.resend[0]).unwrap().payload.as_ref(),
            b"requested again"
        );

        // an unknown sequence is ignored
        let outcome = a.handle_packet(Packet::nack(SeqNo::from_raw(4711)), now);
        assert!(outcome.resend.is_empty());
    }

    #[test]
    fn test_graceful_close_walk() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        // a closes first
        let fin_a = a.begin_close().unwrap();
        a.track_outgoing(&fin_a, fin_a.encode(), now);
        assert_eq!(a.state(), ConnectionState::FinWait1);

        let outcome = b.handle_packet(fin_a, now);
        assert_eq!(b.state(), ConnectionState::CloseWait);
        let fin_ack = outcome.response.unwrap();
        assert_eq!(fin_ack.header.packet_type, PacketType::FinAck);

        a.handle_packet(fin_ack, now);
        assert_eq!(a.state(), ConnectionState::FinWait2);

        // b closes its half
        let fin_b = b.begin_close().unwrap();
        b.track_outgoing(&fin_b, fin_b.encode(), now);
        assert_eq!(b.state(), ConnectionState::LastAck);

        let outcome = a.handle_packet(fin_b, now);
        assert_eq!(a.state(), ConnectionState::TimeWait);

        b.handle_packet(outcome.response.unwrap(), now);
        assert_eq!(b.state(), ConnectionState::Closed);

        // TimeWait expires after 2 * MSL
        assert!(!a.time_wait_expired(now + Duration::from_secs(59)));
        assert!(a.time_wait_expired(now + Duration::from_secs(61)));
        assert!(a.is_closed());
    }

    #[test]
    fn test_simultaneous_close() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        let fin_a = a.begin_close().unwrap();
        a.track_outgoing(&fin_a, fin_a.encode(), now);
        let fin_b = b.begin_close().unwrap();
        b.track_outgoing(&fin_b, fin_b.encode(), now);

        // the FINs cross on the wire
        let ack_from_b = b.handle_packet(fin_a, now).response.unwrap();
        let ack_from_a = a.handle_packet(fin_b, now).response.unwrap();
        assert_eq!(a.state(), ConnectionState::Closing);
        assert_eq!(b.state(), ConnectionState::Closing);

        a.handle_packet(ack_from_b, now);
        b.handle_packet(ack_from_a, now);
        assert_eq!(a.state(), ConnectionState::TimeWait);
        assert_eq!(b.state(), ConnectionState::TimeWait);
    }

    #[test]
    fn test_rst_aborts_waiters() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        send_data(&mut a, &mut b, b"doomed", now);
        let mut rx = a.register_send_waiter(SeqNo::from_raw(1001));

        a.handle_packet(Packet::rst(), now);

        assert!(a.is_closed());
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(TransportError::ConnectionReset(addr(9001)))
        );
    }

    #[test]
    fn test_ping_pong_round_trip() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        let ping = a.make_ping(now);
        a.track_outgoing(&ping, ping.encode(), now);
        assert_eq!(a.unacked.len(), 1);

        let later = now + Duration::from_millis(40);
        let outcome = b.handle_packet(ping, later);
        let pong = outcome.response.unwrap();
        assert_eq!(pong.header.packet_type, PacketType::Pong);
        assert!(outcome.delivered.is_empty());
        // the pong cumulatively covers the ping's sequence number
        assert_eq!(pong.header.ack, SeqNo::from_raw(1002));

        let outcome = a.handle_packet(pong, now + Duration::from_millis(80));
        assert!(outcome.response.is_none());
        assert!(a.unacked.is_empty());
        // RTT came from the echoed timestamp
        assert!((a.srtt.unwrap() - 0.08).abs() < 1e-3);
    }

    #[test]
    fn test_ping_between_data_keeps_ordering_intact() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        send_data(&mut a, &mut b, b"before", now);
        let ping = a.make_ping(now);
        a.track_outgoing(&ping, ping.encode(), now);
        b.handle_packet(ping, now);
        let outcome = send_data(&mut a, &mut b, b"after", now);

        // the data behind the ping is delivered without a gap
        assert_eq!(outcome.delivered.len(), 1);
        assert_eq!(outcome.delivered[0].payload.as_ref(), b"after");
        assert_eq!(outcome.response.unwrap().header.ack, SeqNo::from_raw(1004));
    }

    #[rstest]
    #[case::fresh(0, false)]
    #[case::idle_past_interval(16, true)]
    #[case::idle_below_interval(14, false)]
    fn test_keepalive_due(#[case] idle_secs: u64, #[case] expected: bool) {
        let now = Instant::now();
        let (a, _) = established_pair(now);
        assert_eq!(a.keepalive_due(now + Duration::from_secs(idle_secs)), expected);
    }

    #[test]
    fn test_keepalive_not_repeated_within_interval() {
        let now = Instant::now();
        let (mut a, _) = established_pair(now);

        let idle = now + Duration::from_secs(16);
        assert!(a.keepalive_due(idle));
        let ping = a.make_ping(idle);
        a.track_outgoing(&ping, ping.encode(), idle);

        // a second tick right after must not emit another ping
        assert!(!a.keepalive_due(idle + Duration::from_millis(200)));
    }

    #[test]
    fn test_idle_connection_expires() {
        let now = Instant::now();
        let (a, _) = established_pair(now);
        assert!(!a.idle_expired(now + Duration::from_secs(59)));
        assert!(a.idle_expired(now + Duration::from_secs(61)));
    }

    #[test]
    fn test_window_advertisement_shrinks_with_buffered_data() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        let full_window = b.advertised_window();

        // an out-of-order packet stays buffered
        a.next_seq();
        let p2 = Packet::data(a.next_seq(), SeqNo::ZERO, Bytes::from(vec![0u8; 1000]), 0);
        b.handle_packet(p2, now);

        assert_eq!(b.advertised_window(), full_window - 1000);
    }
}
