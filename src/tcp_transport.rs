use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::fragment::{Fragmenter, Reassembler};
use crate::message_dispatcher::MessageDispatcher;
use crate::packet::Packet;
use crate::packet_header::PacketFlags;
use crate::stats::{TransportCounters, TransportStats};
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Frames longer than this are treated as a broken peer and the connection
/// is dropped.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

struct TcpPeer {
    writer: Mutex<OwnedWriteHalf>,
}

/// The TCP variant of the transport: the same packet format, framed onto the
/// byte stream as a 4-byte big-endian length prefix followed by the packet
/// bytes.
///
/// TCP already provides reliability and ordering, so the connection state
/// machine, retransmission and flow/congestion control are not engaged -
/// this path exists for large, latency-tolerant messages. Fragmentation and
/// reassembly still apply so that either substrate carries the same packets.
pub struct TcpTransport {
    listener: TcpListener,
    peers: RwLock<FxHashMap<SocketAddr, Arc<TcpPeer>>>,
    reassembler: Arc<Mutex<Reassembler>>,
    fragmenter: Fragmenter,
    dispatcher: Arc<dyn MessageDispatcher>,
    counters: Arc<TransportCounters>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub async fn new(
        config: TransportConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<Arc<TcpTransport>> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr()).await?;
        info!("bound TCP transport to {:?}", listener.local_addr()?);

        Ok(Arc::new(TcpTransport {
            listener,
            peers: RwLock::new(FxHashMap::default()),
            reassembler: Arc::new(Mutex::new(Reassembler::new(
                config.reassembly_ttl,
                config.max_reassembly_bytes_per_peer,
            ))),
            fragmenter: Fragmenter::new(config.mss(), config.max_message_size()),
            dispatcher,
            counters: Arc::new(TransportCounters::default()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("bound listener must know its local address")
    }

    /// Spawn the accept loop.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("TCP transport already started");
            return;
        }
        let accept = self.clone();
        tasks.push(tokio::spawn(async move { accept.accept_loop().await }));
    }

    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let peers: Vec<Arc<TcpPeer>> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in peers {
            let _ = peer.writer.lock().await.shutdown().await;
        }
        info!("TCP transport on {:?} stopped", self.local_addr());
    }

    /// Establish an outbound stream to a peer. Idempotent: an existing
    /// stream is reused.
    pub async fn connect(self: &Arc<Self>, peer: SocketAddr) -> anyhow::Result<()> {
        if self.peers.read().await.contains_key(&peer) {
            return Ok(());
        }

        let stream = TcpStream::connect(peer).await?;
        debug!("connected to {:?}", peer);
        self.register_stream(peer, stream).await;
        Ok(())
    }

    /// Send a message to a connected peer: fragment if oversize, then write
    /// each packet as one length-prefixed frame.
    pub async fn send_message(&self, peer: SocketAddr, payload: &[u8]) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!(TransportError::TransportClosed);
        }
        let Some(tcp_peer) = self.peers.read().await.get(&peer).cloned() else {
            bail!("no TCP stream to {:?} - connect first", peer);
        };

        let packets = self.fragmenter.split(payload, false)?;
        let mut writer = tcp_peer.writer.lock().await;
        for packet in packets {
            let frame = packet.encode();
            writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
            writer.write_all(&frame).await?;
            self.counters.count_sent(frame.len());
        }
        writer.flush().await?;
        Ok(())
    }

    pub async fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("accepted TCP connection from {:?}", peer);
                    self.register_stream(peer, stream).await;
                }
                Err(e) => {
                    warn!("TCP accept failed: {}", e);
                    self.counters.count_error();
                }
            }
        }
    }

    async fn register_stream(self: &Arc<Self>, peer: SocketAddr, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        self.peers.write().await.insert(
            peer,
            Arc::new(TcpPeer {
                writer: Mutex::new(writer),
            }),
        );

        let transport = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = transport.receive_loop(peer, reader).await {
                debug!("TCP stream from {:?} ended: {}", peer, e);
            }
            transport.peers.write().await.remove(&peer);
        });
        self.tasks.lock().await.push(task);
    }

    async fn receive_loop(&self, peer: SocketAddr, mut reader: OwnedReadHalf) -> anyhow::Result<()> {
        loop {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf);
            if len > MAX_FRAME_LEN {
                bail!("peer {:?} announced an oversize frame of {} bytes", peer, len);
            }

            let mut frame = vec![0u8; len as usize];
            reader.read_exact(&mut frame).await?;
            self.counters.count_received(frame.len());

            let mut packet = match Packet::decode(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    // on a checksummed byte stream this means a broken sender,
                    // but one bad frame does not have to kill the stream
                    warn!("undecodable frame from {:?}: {}", peer, e);
                    self.counters.count_error();
                    continue;
                }
            };
            trace!(
                "received {:?} frame from {:?} ({} bytes)",
                packet.header.packet_type,
                peer,
                frame.len()
            );

            if packet.header.flags.contains(PacketFlags::COMPRESSED) {
                if let Err(e) = packet.decompress() {
                    warn!("dropping undecodable compressed frame from {:?}: {}", peer, e);
                    self.counters.count_error();
                    continue;
                }
            }

            let completed = self
                .reassembler
                .lock()
                .await
                .on_packet(peer, &packet, Instant::now());
            if let Some(message) = completed {
                self.dispatcher.on_message(peer, &message).await;
            }
        }
    }
}
