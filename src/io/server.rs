//! Server session
//!
//! Listens for peers, keeps a fixed-size peer table indexed by the
//! transport-assigned id, and routes sends as unicast, broadcast or
//! selective broadcast. The peer table is owned by the network thread
//! alone; the application thread only ever names peers by id.

use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::io::{restore_listeners, IncomingPacket, EVENT_QUEUE_CAPACITY, SERVICE_TIMEOUT};
use crate::protocol::codec::PacketWriter;
use crate::protocol::crc;
use crate::protocol::packet::Packet;
use crate::queue::EventQueue;
use crate::stats::{SessionStats, StatsSnapshot};
use crate::transport::{Delivery, PeerId, ServerListener, ServerTransport, TransportEvent};

type ConnectedFn = Box<dyn FnMut(&mut NetServer, PeerId, SocketAddr)>;
type DisconnectedFn = Box<dyn FnMut(&mut NetServer, PeerId)>;
type PacketFn = Box<dyn FnMut(&mut NetServer, PeerId, &[u8], u8)>;

enum SendTarget {
    Peer(PeerId),
    All,
    Subset(Vec<PeerId>),
}

struct OutgoingPacket {
    target: SendTarget,
    channel: u8,
    delivery: Delivery,
    payload: Bytes,
}

struct PeerEvent {
    peer: PeerId,
    addr: SocketAddr,
}

struct ServerQueues {
    connections: EventQueue<PeerEvent>,
    disconnections: EventQueue<PeerEvent>,
    incoming: EventQueue<IncomingPacket>,
    outgoing: EventQueue<OutgoingPacket>,
}

impl ServerQueues {
    fn drain_all(&self) {
        self.connections.drain();
        self.disconnections.drain();
        self.incoming.drain();
        self.outgoing.drain();
    }
}

/// Server endpoint session.
///
/// # Threading
///
/// Same contract as [`NetClient`](crate::io::NetClient): one thread
/// drives the session, `update` is not reentrant.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use packetlink::config::ServerConfig;
/// use packetlink::io::NetServer;
/// use packetlink::transport::udp::UdpListener;
/// use packetlink::transport::Delivery;
///
/// let mut server = NetServer::new(
///     ServerConfig::new(7777, 100).with_bind_all_interfaces(true),
///     Arc::new(UdpListener),
/// );
/// server.on_packet(|server, _peer, data, channel| {
///     // relay everything to everyone
///     let copy = data.to_vec();
///     server.broadcast_bytes(&copy, channel, Delivery::Reliable);
/// });
/// server.start();
/// loop {
///     server.update();
///     std::thread::sleep(std::time::Duration::from_millis(10));
/// }
/// ```
pub struct NetServer {
    config: ServerConfig,
    listener: Arc<dyn ServerListener>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    queues: Arc<ServerQueues>,
    stats: Arc<SessionStats>,
    incoming_buffer: Vec<u8>,
    outgoing_buffer: Vec<u8>,
    on_client_connected: Vec<ConnectedFn>,
    on_client_disconnected: Vec<DisconnectedFn>,
    on_packet: Vec<PacketFn>,
}

impl NetServer {
    /// Create a stopped server session. Out-of-range configuration
    /// values are clamped here.
    pub fn new(config: ServerConfig, listener: Arc<dyn ServerListener>) -> Self {
        let config = config.clamped();
        let queues = ServerQueues {
            connections: EventQueue::new(EVENT_QUEUE_CAPACITY),
            disconnections: EventQueue::new(EVENT_QUEUE_CAPACITY),
            incoming: EventQueue::new(config.incoming_capacity),
            outgoing: EventQueue::new(config.outgoing_capacity),
        };
        NetServer {
            incoming_buffer: vec![0u8; config.buffer_size],
            outgoing_buffer: vec![0u8; config.buffer_size],
            config,
            listener,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            queues: Arc::new(queues),
            stats: Arc::new(SessionStats::default()),
            on_client_connected: Vec::new(),
            on_client_disconnected: Vec::new(),
            on_packet: Vec::new(),
        }
    }

    /// Whether the network thread is running. A failed `start` (bind
    /// failure, port in use) is observed here, not as an error.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Session drop and rejection counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Register a listener invoked by `update` when a peer connects,
    /// with its id and remote address. Listeners run in registration
    /// order.
    pub fn on_client_connected(
        &mut self,
        listener: impl FnMut(&mut NetServer, PeerId, SocketAddr) + 'static,
    ) {
        self.on_client_connected.push(Box::new(listener));
    }

    /// Register a listener invoked by `update` when a peer disconnects
    /// or times out.
    pub fn on_client_disconnected(
        &mut self,
        listener: impl FnMut(&mut NetServer, PeerId) + 'static,
    ) {
        self.on_client_disconnected.push(Box::new(listener));
    }

    /// Register a listener invoked by `update` for every received
    /// payload, with the sending peer, the payload bytes and the
    /// channel.
    ///
    /// The slice borrows the session's reusable incoming buffer; copy
    /// out anything that must outlive the callback.
    pub fn on_packet(
        &mut self,
        listener: impl FnMut(&mut NetServer, PeerId, &[u8], u8) + 'static,
    ) {
        self.on_packet.push(Box::new(listener));
    }

    /// Spawn the network thread. No-op while already running.
    ///
    /// All four queues are drained first so a restarted session never
    /// sees stale entries from a previous run.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }

        self.queues.drain_all();
        self.running.store(true, Ordering::Release);
        info!(
            port = self.config.port,
            max_clients = self.config.max_clients,
            "starting server"
        );

        let config = self.config.clone();
        let listener = Arc::clone(&self.listener);
        let running = Arc::clone(&self.running);
        let queues = Arc::clone(&self.queues);
        let stats = Arc::clone(&self.stats);

        let spawned = std::thread::Builder::new()
            .name("packetlink-server".into())
            .spawn(move || network_loop(config, listener, running, queues, stats));
        match spawned {
            Ok(handle) => self.thread = Some(handle),
            Err(e) => {
                error!(error = %e, "could not spawn server network thread");
                self.running.store(false, Ordering::Release);
            }
        }
    }

    /// Clear the running flag and block until the network thread has
    /// exited. No-op while already stopped.
    pub fn stop(&mut self) {
        if !self.is_running() {
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
            return;
        }
        info!("stopping server");
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Queue raw bytes for one peer. Fire-and-forget; an id that no
    /// longer names a connected peer is counted and skipped at flush
    /// time.
    pub fn send_bytes_to(&mut self, peer: PeerId, data: &[u8], channel: u8, delivery: Delivery) {
        self.enqueue_outgoing(
            SendTarget::Peer(peer),
            Bytes::copy_from_slice(data),
            channel,
            delivery,
        );
    }

    /// Serialize a packet and queue it for one peer.
    pub fn send_to<P: Packet>(
        &mut self,
        peer: PeerId,
        packet: &P,
        channel: u8,
        delivery: Delivery,
    ) -> Result<()> {
        let payload = self.serialize(packet)?;
        self.enqueue_outgoing(SendTarget::Peer(peer), payload, channel, delivery);
        Ok(())
    }

    /// Queue raw bytes for every connected peer.
    pub fn broadcast_bytes(&mut self, data: &[u8], channel: u8, delivery: Delivery) {
        self.enqueue_outgoing(
            SendTarget::All,
            Bytes::copy_from_slice(data),
            channel,
            delivery,
        );
    }

    /// Serialize a packet and queue it for every connected peer.
    pub fn broadcast<P: Packet>(
        &mut self,
        packet: &P,
        channel: u8,
        delivery: Delivery,
    ) -> Result<()> {
        let payload = self.serialize(packet)?;
        self.enqueue_outgoing(SendTarget::All, payload, channel, delivery);
        Ok(())
    }

    /// Queue raw bytes for a subset of peers. Ids that are out of range
    /// or name an empty slot are skipped; a subset that resolves to no
    /// peers releases the payload without sending; neither is an
    /// error.
    pub fn broadcast_bytes_to(
        &mut self,
        peers: &[PeerId],
        data: &[u8],
        channel: u8,
        delivery: Delivery,
    ) {
        self.enqueue_outgoing(
            SendTarget::Subset(peers.to_vec()),
            Bytes::copy_from_slice(data),
            channel,
            delivery,
        );
    }

    /// Serialize a packet and queue it for a subset of peers.
    pub fn broadcast_to<P: Packet>(
        &mut self,
        peers: &[PeerId],
        packet: &P,
        channel: u8,
        delivery: Delivery,
    ) -> Result<()> {
        let payload = self.serialize(packet)?;
        self.enqueue_outgoing(SendTarget::Subset(peers.to_vec()), payload, channel, delivery);
        Ok(())
    }

    fn serialize<P: Packet>(&mut self, packet: &P) -> Result<Bytes> {
        self.outgoing_buffer.fill(0);
        let mut writer = PacketWriter::new(&mut self.outgoing_buffer);
        let length = packet.serialize(&mut writer)?;
        Ok(Bytes::copy_from_slice(&self.outgoing_buffer[..length]))
    }

    fn enqueue_outgoing(
        &self,
        target: SendTarget,
        payload: Bytes,
        channel: u8,
        delivery: Delivery,
    ) {
        let packet = OutgoingPacket {
            target,
            channel,
            delivery,
            payload,
        };
        if self.queues.outgoing.push(packet).is_err() {
            SessionStats::count(&self.stats.queue_rejections);
            warn!(
                capacity = self.queues.outgoing.capacity(),
                "outgoing queue full, dropping send"
            );
        }
    }

    /// Drain queued events and invoke listeners synchronously:
    /// connections first, then disconnections, then received packets in
    /// arrival order. Same contract as
    /// [`NetClient::update`](crate::io::NetClient::update).
    pub fn update(&mut self) {
        while let Some(event) = self.queues.connections.try_pop() {
            let mut listeners = mem::take(&mut self.on_client_connected);
            for listener in listeners.iter_mut() {
                listener(self, event.peer, event.addr);
            }
            restore_listeners(&mut self.on_client_connected, listeners);
        }

        while let Some(event) = self.queues.disconnections.try_pop() {
            let mut listeners = mem::take(&mut self.on_client_disconnected);
            for listener in listeners.iter_mut() {
                listener(self, event.peer);
            }
            restore_listeners(&mut self.on_client_disconnected, listeners);
        }

        while let Some(packet) = self.queues.incoming.try_pop() {
            let length = packet.payload.len();
            if length > self.config.max_packet_size {
                SessionStats::count(&self.stats.oversized_incoming);
                trace!(length, peer = packet.peer, "releasing oversized incoming packet");
                continue;
            }

            let mut buffer = mem::take(&mut self.incoming_buffer);
            buffer.fill(0);
            buffer[..length].copy_from_slice(&packet.payload);
            let peer = packet.peer;
            let channel = packet.channel;
            drop(packet);

            let mut listeners = mem::take(&mut self.on_packet);
            for listener in listeners.iter_mut() {
                listener(self, peer, &buffer[..length], channel);
            }
            restore_listeners(&mut self.on_packet, listeners);
            self.incoming_buffer = buffer;
        }
    }

    #[cfg(test)]
    fn queued_counts(&self) -> (usize, usize, usize, usize) {
        (
            self.queues.connections.len(),
            self.queues.disconnections.len(),
            self.queues.incoming.len(),
            self.queues.outgoing.len(),
        )
    }
}

impl Drop for NetServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn network_loop(
    config: ServerConfig,
    listener: Arc<dyn ServerListener>,
    running: Arc<AtomicBool>,
    queues: Arc<ServerQueues>,
    stats: Arc<SessionStats>,
) {
    let mut transport = match listener.listen(&config) {
        Ok(transport) => transport,
        Err(e) => {
            error!(port = config.port, error = %e, "could not open server transport");
            running.store(false, Ordering::Release);
            return;
        }
    };
    transport.set_checksum(Some(crc::checksum));
    info!(
        addr = config.effective_bind_address(),
        port = config.port,
        max_clients = config.max_clients,
        "server listening"
    );

    // transport-assigned peer id indexes this table; only this thread
    // ever touches it
    let mut peers: Vec<Option<SocketAddr>> = vec![None; config.max_clients as usize];

    while running.load(Ordering::Acquire) {
        flush_outgoing(transport.as_mut(), &config, &queues, &stats, &peers);

        let mut polled = false;
        while !polled {
            let event = match transport.check_event() {
                Some(event) => event,
                None => match transport.service(SERVICE_TIMEOUT) {
                    Ok(Some(event)) => {
                        polled = true;
                        event
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "transport service failed");
                        std::thread::sleep(SERVICE_TIMEOUT);
                        break;
                    }
                },
            };
            translate(event, transport.as_mut(), &mut peers, &queues, &stats);
        }
    }

    transport.flush();
    // hang up on everyone still connected before tearing down the host
    for (slot, entry) in peers.iter().enumerate() {
        if entry.is_some() {
            transport.disconnect(slot as PeerId);
        }
    }
    info!("server stopped");
}

fn flush_outgoing(
    transport: &mut dyn ServerTransport,
    config: &ServerConfig,
    queues: &ServerQueues,
    stats: &SessionStats,
    peers: &[Option<SocketAddr>],
) {
    let connected = |peer: PeerId| {
        peers
            .get(peer as usize)
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    };

    while let Some(packet) = queues.outgoing.try_pop() {
        if packet.payload.len() > config.max_packet_size {
            SessionStats::count(&stats.oversized_outgoing);
            trace!(
                length = packet.payload.len(),
                max = config.max_packet_size,
                "releasing oversized outgoing packet"
            );
            continue;
        }

        let result = match packet.target {
            SendTarget::Peer(peer) => {
                if !connected(peer) {
                    SessionStats::count(&stats.invalid_targets);
                    trace!(peer, "releasing packet for unknown peer");
                    continue;
                }
                transport.send(peer, packet.channel, &packet.payload, packet.delivery)
            }
            SendTarget::All => transport.broadcast(packet.channel, &packet.payload, packet.delivery),
            SendTarget::Subset(ids) => {
                let mut resolved = Vec::with_capacity(ids.len());
                for id in ids {
                    if connected(id) {
                        resolved.push(id);
                    } else {
                        SessionStats::count(&stats.invalid_targets);
                    }
                }
                if resolved.is_empty() {
                    SessionStats::count(&stats.empty_broadcasts);
                    trace!("selective broadcast resolved to no peers, releasing packet");
                    continue;
                }
                transport.broadcast_to(&resolved, packet.channel, &packet.payload, packet.delivery)
            }
        };
        if let Err(e) = result {
            debug!(error = %e, "transport send failed");
        }
    }
}

fn translate(
    event: TransportEvent,
    transport: &mut dyn ServerTransport,
    peers: &mut [Option<SocketAddr>],
    queues: &ServerQueues,
    stats: &SessionStats,
) {
    match event {
        TransportEvent::Connect { peer, addr } => {
            let Some(slot) = peers.get_mut(peer as usize) else {
                // never index outside the table, however the transport behaves
                warn!(peer, table = peers.len(), "refusing peer outside table bounds");
                transport.disconnect(peer);
                return;
            };
            *slot = Some(addr);
            if queues.connections.push(PeerEvent { peer, addr }).is_err() {
                SessionStats::count(&stats.queue_rejections);
                warn!(peer, "connection queue full, dropping event");
            }
        }
        TransportEvent::Disconnect { peer } | TransportEvent::Timeout { peer } => {
            let Some(slot) = peers.get_mut(peer as usize) else {
                warn!(peer, "ignoring disconnect outside table bounds");
                return;
            };
            let Some(addr) = slot.take() else {
                debug!(peer, "ignoring disconnect for empty slot");
                return;
            };
            if queues.disconnections.push(PeerEvent { peer, addr }).is_err() {
                SessionStats::count(&stats.queue_rejections);
                warn!(peer, "disconnection queue full, dropping event");
            }
        }
        TransportEvent::Receive {
            peer,
            channel,
            payload,
        } => {
            let packet = IncomingPacket {
                peer,
                channel,
                payload,
            };
            if queues.incoming.push(packet).is_err() {
                SessionStats::count(&stats.queue_rejections);
                warn!(peer, "incoming queue full, releasing packet");
            }
        }
    }
}
