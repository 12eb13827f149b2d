use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::TransportError;
use crate::fragment::{Fragmenter, Reassembler};
use crate::message_dispatcher::MessageDispatcher;
use crate::packet::Packet;
use crate::packet_header::{PacketFlags, PacketType};
use crate::send_socket::SendPipeline;
use crate::stats::{TransportCounters, TransportStats};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};

/// Parse a `host:port` string into a peer address.
pub fn parse_peer_addr(addr: &str) -> Result<SocketAddr, TransportError> {
    addr.parse()
        .map_err(|_| TransportError::InvalidPeer(addr.to_string()))
}

/// A connection plus its admission signal. The mutex is the per-peer unit of
/// serialization: state transitions and sequence assignment are atomic from
/// the connection's point of view. `window_changed` wakes senders blocked on
/// flow-control admission whenever an ACK (or teardown) may have changed the
/// effective window.
struct ConnectionHandle {
    conn: Mutex<Connection>,
    window_changed: Notify,
}

/// The datagram transport: owns the UDP socket, the per-peer connection
/// table and the reassembly buffers, and runs the receive and maintenance
/// loops.
///
/// Two send primitives share the wire format: `send_unreliable` writes raw
/// datagrams with no connection state, `send_reliable` drives the per-peer
/// connection (handshake on demand, sequencing, retransmission) and completes
/// when the last packet of the message is cumulatively acknowledged.
pub struct UdpTransport {
    config: Arc<TransportConfig>,
    receive_socket: Arc<UdpSocket>,
    send_pipeline: SendPipeline,
    connections: RwLock<FxHashMap<SocketAddr, Arc<ConnectionHandle>>>,
    reassembler: Mutex<Reassembler>,
    fragmenter: Fragmenter,
    dispatcher: Arc<dyn MessageDispatcher>,
    counters: Arc<TransportCounters>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl UdpTransport {
    pub async fn new(
        config: TransportConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<Arc<UdpTransport>> {
        config.validate()?;
        let config = Arc::new(config);

        let socket = Arc::new(UdpSocket::bind(config.bind_addr()).await?);
        info!("bound transport socket to {:?}", socket.local_addr()?);

        let counters = Arc::new(TransportCounters::default());
        Ok(Arc::new(UdpTransport {
            send_pipeline: SendPipeline::new(Arc::new(socket.clone()), counters.clone()),
            receive_socket: socket,
            connections: RwLock::new(FxHashMap::default()),
            reassembler: Mutex::new(Reassembler::new(
                config.reassembly_ttl,
                config.max_reassembly_bytes_per_peer,
            )),
            fragmenter: Fragmenter::new(config.mss(), config.max_message_size()),
            dispatcher,
            counters,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            config,
        }))
    }

    /// The actual bound address (useful when the configured port was 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.receive_socket
            .local_addr()
            .expect("bound transport socket must know its local address")
    }

    /// Spawn the receive loop and the maintenance ticker.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("transport already started");
            return;
        }

        let recv = self.clone();
        tasks.push(tokio::spawn(async move { recv.receive_loop().await }));

        let maint = self.clone();
        tasks.push(tokio::spawn(async move { maint.maintenance_loop().await }));
    }

    /// Tear down: stops the loops and fails every pending reliable send with
    /// `TransportClosed`. The socket is released when the transport is
    /// dropped.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        let handles: Vec<Arc<ConnectionHandle>> =
            self.connections.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.conn.lock().await.abort(TransportError::TransportClosed);
            handle.window_changed.notify_waiters();
        }
        info!("transport on {:?} stopped", self.local_addr());
    }

    /// Fire-and-forget: the message is fragmented if oversize and written to
    /// the socket without creating connection state. Success means the
    /// datagrams left this node, nothing more.
    pub async fn send_unreliable(
        &self,
        peer: SocketAddr,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::TransportClosed);
        }

        let packets = self.fragmenter.split(payload, false)?;
        trace!(
            "sending {} byte message to {:?} unreliably in {} packets",
            payload.len(),
            peer,
            packets.len()
        );
        for packet in packets {
            self.send_pipeline.send_packet(peer, &packet.encode()).await;
        }
        Ok(())
    }

    /// Reliable send: establishes a connection on demand, splits the message,
    /// admits each packet through the flow/congestion controller and returns
    /// once the final packet is cumulatively acknowledged - or fails with a
    /// timeout/reset error within the caller's budget.
    pub async fn send_reliable(
        &self,
        peer: SocketAddr,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::TransportClosed);
        }
        let deadline = Instant::now() + timeout;

        let handle = self.get_or_create_connection(peer).await;
        self.await_established(peer, &handle, deadline).await?;

        let packets = self.fragmenter.split(payload, true)?;
        let total = packets.len();
        let mut completion = None;

        for (index, mut packet) in packets.into_iter().enumerate() {
            loop {
                let mut notified = pin!(handle.window_changed.notified());
                notified.as_mut().enable();

                let encoded = {
                    let mut conn = handle.conn.lock().await;
                    if conn.is_closed() {
                        return Err(TransportError::ConnectionReset(peer));
                    }
                    if conn.can_send(packet.payload_len()) {
                        packet.header.sequence = conn.next_seq();
                        packet.header.window = conn.advertised_window();
                        let encoded = packet.encode();
                        if index + 1 == total {
                            completion = Some(conn.register_send_waiter(packet.header.sequence));
                        }
                        conn.track_outgoing(&packet, encoded.clone(), Instant::now());
                        Some(encoded)
                    } else {
                        trace!(
                            "send to {:?} blocked on flow control ({} byte packet)",
                            peer,
                            packet.payload_len()
                        );
                        None
                    }
                };

                match encoded {
                    Some(bytes) => {
                        self.send_pipeline.send_packet(peer, &bytes).await;
                        break;
                    }
                    None => {
                        if timeout_at(deadline, notified).await.is_err() {
                            return Err(TransportError::SendTimeout(peer));
                        }
                    }
                }
            }
        }

        let completion = completion.expect("a non-empty message has a final packet");
        match timeout_at(deadline, completion).await {
            Err(_) => Err(TransportError::SendTimeout(peer)),
            Ok(Err(_)) => Err(TransportError::ConnectionReset(peer)),
            Ok(Ok(result)) => result,
        }
    }

    /// Gracefully close the connection to a peer, if one exists.
    pub async fn disconnect(&self, peer: SocketAddr) {
        let Some(handle) = self.lookup_connection(peer).await else {
            return;
        };
        let fin = {
            let mut conn = handle.conn.lock().await;
            let Some(fin) = conn.begin_close() else {
                return;
            };
            let encoded = fin.encode();
            conn.track_outgoing(&fin, encoded.clone(), Instant::now());
            encoded
        };
        self.send_pipeline.send_packet(peer, &fin).await;
    }

    pub async fn stats(&self) -> TransportStats {
        let mut stats = self.counters.snapshot();
        for (addr, handle) in self.connections.read().await.iter() {
            stats.connections.insert(*addr, handle.conn.lock().await.stats());
        }
        stats
    }

    async fn await_established(
        &self,
        peer: SocketAddr,
        handle: &Arc<ConnectionHandle>,
        deadline: Instant,
    ) -> Result<(), TransportError> {
        use crate::connection::ConnectionState as S;

        let (waiter, syn) = {
            let mut conn = handle.conn.lock().await;
            match conn.state() {
                S::Established => return Ok(()),
                S::Closed => {
                    let syn = conn.initiate();
                    let encoded = syn.encode();
                    conn.track_outgoing(&syn, encoded.clone(), Instant::now());
                    (conn.register_connect_waiter(), Some(encoded))
                }
                // someone else is mid-handshake; join the wait
                S::Listen | S::SynSent | S::SynRcvd => (conn.register_connect_waiter(), None),
                _ => return Err(TransportError::ConnectionReset(peer)),
            }
        };

        if let Some(encoded) = syn {
            debug!("initiating handshake with {:?}", peer);
            self.send_pipeline.send_packet(peer, &encoded).await;
        }

        match timeout_at(deadline, waiter).await {
            Err(_) => Err(TransportError::HandshakeTimeout(peer)),
            Ok(Err(_)) => Err(TransportError::ConnectionReset(peer)),
            Ok(Ok(result)) => result,
        }
    }

    async fn lookup_connection(&self, peer: SocketAddr) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().await.get(&peer).cloned()
    }

    async fn get_or_create_connection(&self, peer: SocketAddr) -> Arc<ConnectionHandle> {
        if let Some(handle) = self.lookup_connection(peer).await {
            return handle;
        }

        let mut table = self.connections.write().await;
        table
            .entry(peer)
            .or_insert_with(|| {
                debug!("creating connection state for {:?}", peer);
                Arc::new(ConnectionHandle {
                    conn: Mutex::new(Connection::new(peer, self.config.clone(), Instant::now())),
                    window_changed: Notify::new(),
                })
            })
            .clone()
    }

    async fn receive_loop(self: Arc<Self>) {
        info!("starting receive loop on {:?}", self.local_addr());
        let mut buf = vec![0u8; 65536];

        loop {
            let (len, from) = match self.receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    self.counters.count_error();
                    continue;
                }
            };
            self.handle_datagram(&buf[..len], from).await;
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        self.counters.count_received(data.len());

        let mut packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping datagram from {:?}: {}", from, e);
                self.counters.count_error();
                return;
            }
        };
        trace!(
            "received {:?} packet from {:?} (seq {}, ack {})",
            packet.header.packet_type,
            from,
            packet.header.sequence,
            packet.header.ack
        );

        if packet.header.flags.contains(PacketFlags::COMPRESSED) {
            if let Err(e) = packet.decompress() {
                warn!("dropping undecodable compressed packet from {:?}: {}", from, e);
                self.counters.count_error();
                return;
            }
        }

        // fire-and-forget payloads bypass connection state entirely
        if !packet.header.packet_type.is_control() && !packet.requires_ack() {
            self.deliver(from, &packet, false).await;
            return;
        }

        let handle = match self.lookup_connection(from).await {
            Some(handle) => handle,
            None if packet.header.packet_type == PacketType::Syn => {
                let handle = self.get_or_create_connection(from).await;
                handle.conn.lock().await.listen();
                handle
            }
            None => {
                debug!(
                    "dropping {:?} packet from unknown peer {:?}",
                    packet.header.packet_type, from
                );
                return;
            }
        };

        let (response, delivered, resend, conn_closed) = {
            let mut conn = handle.conn.lock().await;
            let outcome = conn.handle_packet(packet, Instant::now());

            let response = outcome.response.map(|response| {
                let encoded = response.encode();
                if response.requires_ack() {
                    conn.track_outgoing(&response, encoded.clone(), Instant::now());
                }
                encoded
            });
            (response, outcome.delivered, outcome.resend, conn.is_closed())
        };
        handle.window_changed.notify_waiters();

        if !resend.is_empty() {
            self.counters
                .retransmissions
                .fetch_add(resend.len() as u64, Ordering::Relaxed);
        }
        for bytes in resend {
            self.send_pipeline.send_packet(from, &bytes).await;
        }
        if let Some(bytes) = response {
            self.send_pipeline.send_packet(from, &bytes).await;
        }
        for packet in delivered {
            self.deliver(from, &packet, true).await;
        }

        if conn_closed {
            // the peer reset us; drop the table entry so a future send starts fresh
            self.connections.write().await.remove(&from);
        }
    }

    /// Run an in-order payload packet through reassembly and hand completed
    /// messages to the application. Completion of a reliable fragmented
    /// message is announced back to the sender.
    async fn deliver(&self, from: SocketAddr, packet: &Packet, reliable: bool) {
        let completed = self
            .reassembler
            .lock()
            .await
            .on_packet(from, packet, Instant::now());

        let Some(message) = completed else {
            return;
        };
        if reliable && packet.is_fragment() {
            let ack = Packet::fragment_ack(packet.header.fragment_id).encode();
            self.send_pipeline.send_packet(from, &ack).await;
        }
        self.dispatcher.on_message(from, &message).await;
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.maintenance_interval);
        loop {
            ticker.tick().await;
            self.maintenance_tick().await;
        }
    }

    /// One pass over all connections: retransmit what the RTO says is lost,
    /// keep idle connections alive, reset dead ones, expire TimeWait, and
    /// evict stale reassemblies.
    async fn maintenance_tick(&self) {
        let now = Instant::now();
        let handles: Vec<(SocketAddr, Arc<ConnectionHandle>)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(addr, handle)| (*addr, handle.clone()))
            .collect();

        let mut to_remove = Vec::new();
        for (addr, handle) in handles {
            let mut sends: Vec<Bytes> = Vec::new();
            {
                let mut conn = handle.conn.lock().await;

                let maintenance = conn.scan_retransmissions(now);
                if !maintenance.resend.is_empty() {
                    self.counters
                        .retransmissions
                        .fetch_add(maintenance.resend.len() as u64, Ordering::Relaxed);
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                sends.extend(maintenance.resend);

                if let Some(reset) = maintenance.reset {
                    sends.push(reset.encode());
                    to_remove.push(addr);
                } else if conn.idle_expired(now) {
                    debug!("connection {:?} idle for too long - resetting", addr);
                    conn.abort(TransportError::ConnectionReset(addr));
                    sends.push(Packet::rst().encode());
                    to_remove.push(addr);
                } else if conn.time_wait_expired(now) {
                    to_remove.push(addr);
                } else if conn.is_closed() {
                    // leftover closed connection (graceful close or reset);
                    // reap it once it has been quiet for a full timeout
                    if conn.quiet_for(now) > self.config.connection_timeout {
                        to_remove.push(addr);
                    }
                } else if conn.keepalive_due(now) {
                    debug!("sending keepalive ping to {:?}", addr);
                    let ping = conn.make_ping(now);
                    let encoded = ping.encode();
                    conn.track_outgoing(&ping, encoded.clone(), now);
                    sends.push(encoded);
                }
            }
            handle.window_changed.notify_waiters();

            for bytes in sends {
                self.send_pipeline.send_packet(addr, &bytes).await;
            }
        }

        if !to_remove.is_empty() {
            let mut table = self.connections.write().await;
            for addr in to_remove {
                table.remove(&addr);
            }
        }

        self.reassembler.lock().await.evict_expired(now);
    }
}
