//! In-process transport for client/server pairs in one process
//!
//! Keeps every byte in memory behind a port-keyed hub: servers listen
//! on a port of the hub, clients connect to it, and `service` blocks on
//! a condvar instead of a socket. Used by the test suite and by
//! singleplayer setups that run client and server in the same process.
//!
//! Delivery is always in order and nothing is ever lost, so both
//! [`Delivery`] modes behave identically here.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{LinkError, Result};
use crate::transport::{
    ChecksumFn, ClientConnector, ClientTransport, Delivery, PeerId, ServerListener,
    ServerTransport, TransportEvent,
};

/// Internal frame queued between the two halves.
///
/// Mirrors [`TransportEvent`] except that received payloads carry the
/// checksum stamped by the sender, verified against the receiving
/// host's installed checksum on delivery.
enum Frame {
    Connect { peer: PeerId, addr: SocketAddr },
    Disconnect { peer: PeerId },
    Receive { peer: PeerId, channel: u8, payload: Bytes, crc: Option<u32> },
}

#[derive(Default)]
struct FrameQueue {
    frames: VecDeque<Frame>,
}

/// Mailbox with a condvar so `service` can block with a timeout.
struct Mailbox {
    queue: Mutex<FrameQueue>,
    ready: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox {
            queue: Mutex::new(FrameQueue::default()),
            ready: Condvar::new(),
        }
    }

    fn push(&self, frame: Frame) {
        let mut queue = self.queue.lock().unwrap();
        queue.frames.push_back(frame);
        self.ready.notify_one();
    }

    fn try_pop(&self) -> Option<Frame> {
        self.queue.lock().unwrap().frames.pop_front()
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(frame) = queue.frames.pop_front() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.ready.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
    }
}

struct PeerLink {
    addr: SocketAddr,
    mailbox: Mailbox,
    connected: Mutex<bool>,
}

impl PeerLink {
    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn set_connected(&self, connected: bool) {
        *self.connected.lock().unwrap() = connected;
    }
}

struct ServerShared {
    port: u16,
    mailbox: Mailbox,
    slots: Mutex<Vec<Option<Arc<PeerLink>>>>,
}

impl ServerShared {
    fn link(&self, peer: PeerId) -> Option<Arc<PeerLink>> {
        let slots = self.slots.lock().unwrap();
        slots.get(peer as usize).and_then(|slot| slot.clone())
    }
}

/// Port-keyed hub that memory transports attach to.
///
/// One hub is one isolated network: servers listen on its ports,
/// clients connect through the same hub instance. The hub implements
/// both factory traits, so it can be handed to sessions directly.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use packetlink::transport::memory::MemoryNetwork;
/// use packetlink::config::{ClientConfig, ServerConfig};
/// use packetlink::io::{NetClient, NetServer};
///
/// let network = Arc::new(MemoryNetwork::new());
/// let mut server = NetServer::new(ServerConfig::new(7777, 8), network.clone());
/// let mut client = NetClient::new(ClientConfig::new("memory", 7777), network);
/// ```
#[derive(Clone)]
pub struct MemoryNetwork {
    servers: Arc<Mutex<HashMap<u16, Arc<ServerShared>>>>,
}

impl MemoryNetwork {
    /// Create an empty hub.
    pub fn new() -> Self {
        MemoryNetwork {
            servers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether a server currently listens on `port`.
    ///
    /// Server sessions bind on their network thread, so this is the
    /// signal that a just-started server is ready to accept connects.
    pub fn is_listening(&self, port: u16) -> bool {
        self.servers.lock().unwrap().contains_key(&port)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerListener for MemoryNetwork {
    fn listen(&self, config: &ServerConfig) -> Result<Box<dyn ServerTransport>> {
        let mut servers = self.servers.lock().unwrap();
        if servers.contains_key(&config.port) {
            return Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("memory port {} already bound", config.port),
            )));
        }

        let shared = Arc::new(ServerShared {
            port: config.port,
            mailbox: Mailbox::new(),
            slots: Mutex::new((0..config.max_clients).map(|_| None).collect()),
        });
        servers.insert(config.port, shared.clone());
        debug!(port = config.port, max_clients = config.max_clients, "memory server listening");

        Ok(Box::new(MemoryServerTransport {
            hub: self.clone(),
            shared,
            checksum: None,
        }))
    }
}

impl ClientConnector for MemoryNetwork {
    fn connect(&self, config: &ClientConfig) -> Result<Box<dyn ClientTransport>> {
        let server = {
            let servers = self.servers.lock().unwrap();
            servers.get(&config.port).cloned()
        }
        .ok_or_else(|| {
            LinkError::ConnectionRefused(format!("no memory server on port {}", config.port))
        })?;

        let mut slots = server.slots.lock().unwrap();
        let peer = slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or_else(|| {
                LinkError::ConnectionRefused(format!(
                    "memory server on port {} is full",
                    server.port
                ))
            })? as PeerId;

        let addr = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            49152u16.wrapping_add(peer as u16),
        );
        let link = Arc::new(PeerLink {
            addr,
            mailbox: Mailbox::new(),
            connected: Mutex::new(true),
        });
        slots[peer as usize] = Some(link.clone());
        drop(slots);

        // both halves observe the handshake as an event
        server.mailbox.push(Frame::Connect { peer, addr });
        link.mailbox.push(Frame::Connect {
            peer: 0,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), server.port),
        });
        debug!(port = server.port, peer, "memory client connected");

        Ok(Box::new(MemoryClientTransport {
            server,
            link,
            peer,
            checksum: None,
        }))
    }
}

fn deliver(frame: Frame, checksum: Option<ChecksumFn>) -> Option<TransportEvent> {
    match frame {
        Frame::Connect { peer, addr } => Some(TransportEvent::Connect { peer, addr }),
        Frame::Disconnect { peer } => Some(TransportEvent::Disconnect { peer }),
        Frame::Receive { peer, channel, payload, crc } => {
            if let (Some(verify), Some(expected)) = (checksum, crc) {
                let actual = verify(&payload);
                if actual != expected {
                    warn!(peer, expected, actual, "dropping payload with bad checksum");
                    return None;
                }
            }
            Some(TransportEvent::Receive { peer, channel, payload })
        }
    }
}

/// Client half of a memory connection.
pub struct MemoryClientTransport {
    server: Arc<ServerShared>,
    link: Arc<PeerLink>,
    peer: PeerId,
    checksum: Option<ChecksumFn>,
}

impl ClientTransport for MemoryClientTransport {
    fn check_event(&mut self) -> Option<TransportEvent> {
        let frame = self.link.mailbox.try_pop()?;
        deliver(frame, self.checksum)
    }

    fn service(&mut self, timeout: Duration) -> Result<Option<TransportEvent>> {
        Ok(self
            .link
            .mailbox
            .pop_timeout(timeout)
            .and_then(|frame| deliver(frame, self.checksum)))
    }

    fn send(&mut self, channel: u8, payload: &[u8], _delivery: Delivery) -> Result<()> {
        if !self.link.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let payload = Bytes::copy_from_slice(payload);
        let crc = self.checksum.map(|f| f(&payload));
        self.server.mailbox.push(Frame::Receive {
            peer: self.peer,
            channel,
            payload,
            crc,
        });
        Ok(())
    }

    fn set_checksum(&mut self, checksum: Option<ChecksumFn>) {
        self.checksum = checksum;
    }

    fn flush(&mut self) {
        // sends are delivered synchronously; nothing is buffered
    }

    fn disconnect(&mut self) {
        if !self.link.is_connected() {
            return;
        }
        self.link.set_connected(false);
        let mut slots = self.server.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(self.peer as usize) {
            *slot = None;
        }
        drop(slots);
        self.server.mailbox.push(Frame::Disconnect { peer: self.peer });
        trace!(peer = self.peer, "memory client disconnected");
    }
}

impl Drop for MemoryClientTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Server half: the listening host plus its connected peer links.
pub struct MemoryServerTransport {
    hub: MemoryNetwork,
    shared: Arc<ServerShared>,
    checksum: Option<ChecksumFn>,
}

impl ServerTransport for MemoryServerTransport {
    fn check_event(&mut self) -> Option<TransportEvent> {
        let frame = self.shared.mailbox.try_pop()?;
        deliver(frame, self.checksum)
    }

    fn service(&mut self, timeout: Duration) -> Result<Option<TransportEvent>> {
        Ok(self
            .shared
            .mailbox
            .pop_timeout(timeout)
            .and_then(|frame| deliver(frame, self.checksum)))
    }

    fn send(&mut self, peer: PeerId, channel: u8, payload: &[u8], _delivery: Delivery) -> Result<()> {
        let link = self.shared.link(peer).ok_or(LinkError::NotConnected)?;
        let payload = Bytes::copy_from_slice(payload);
        let crc = self.checksum.map(|f| f(&payload));
        link.mailbox.push(Frame::Receive {
            peer: 0,
            channel,
            payload,
            crc,
        });
        Ok(())
    }

    fn broadcast(&mut self, channel: u8, payload: &[u8], _delivery: Delivery) -> Result<()> {
        let links: Vec<Arc<PeerLink>> = {
            let slots = self.shared.slots.lock().unwrap();
            slots.iter().flatten().cloned().collect()
        };
        for link in links {
            let payload = Bytes::copy_from_slice(payload);
            let crc = self.checksum.map(|f| f(&payload));
            link.mailbox.push(Frame::Receive {
                peer: 0,
                channel,
                payload,
                crc,
            });
        }
        Ok(())
    }

    fn broadcast_to(
        &mut self,
        peers: &[PeerId],
        channel: u8,
        payload: &[u8],
        delivery: Delivery,
    ) -> Result<()> {
        for &peer in peers {
            self.send(peer, channel, payload, delivery)?;
        }
        Ok(())
    }

    fn set_checksum(&mut self, checksum: Option<ChecksumFn>) {
        self.checksum = checksum;
    }

    fn flush(&mut self) {
        // sends are delivered synchronously; nothing is buffered
    }

    fn disconnect(&mut self, peer: PeerId) {
        let mut slots = self.shared.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(peer as usize) {
            if let Some(link) = slot.take() {
                link.set_connected(false);
                link.mailbox.push(Frame::Disconnect { peer: 0 });
                trace!(peer, "memory server disconnected peer");
            }
        }
    }
}

impl Drop for MemoryServerTransport {
    fn drop(&mut self) {
        // unbind the port and hang up on everyone still connected
        let peers: Vec<PeerId> = {
            let slots = self.shared.slots.lock().unwrap();
            (0..slots.len() as PeerId).collect()
        };
        for peer in peers {
            self.disconnect(peer);
        }
        self.hub.servers.lock().unwrap().remove(&self.shared.port);
    }
}
