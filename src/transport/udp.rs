//! Best-effort UDP datagram transport
//!
//! Connectionless UDP dressed up with a minimal session layer: a
//! connect/accept handshake, keepalive pings, an inactivity timeout
//! surfaced as [`TransportEvent::Timeout`], and a goodbye datagram for
//! graceful disconnects. Payload datagrams carry a two-byte frame
//! header (kind + channel) and, when a checksum is installed, a 4-byte
//! trailer validated on receipt.
//!
//! # Important notes
//!
//! - **No delivery guarantee**: datagrams may be lost, duplicated or
//!   reordered; [`Delivery::Reliable`] is advisory here. Reliability
//!   belongs to an ENet-class transport behind the same traits.
//! - **MTU limitation**: a single datagram is limited to 65507 bytes
//!   minus the frame overhead.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{LinkError, Result};
use crate::transport::{
    ChecksumFn, ClientConnector, ClientTransport, Delivery, PeerId, ServerListener,
    ServerTransport, TransportEvent,
};

/// Maximum UDP datagram size (IPv4 max - IP header - UDP header).
pub const MAX_UDP_DATAGRAM_SIZE: usize = 65507;

/// Bytes of frame header in front of every payload.
const FRAME_HEADER: usize = 2;

/// Datagram kinds.
mod kind {
    /// Client requests a connection.
    pub const CONNECT: u8 = 0x01;
    /// Server accepts a connection.
    pub const ACCEPT: u8 = 0x02;
    /// Either side hangs up.
    pub const DISCONNECT: u8 = 0x03;
    /// Keepalive.
    pub const PING: u8 = 0x04;
    /// Application payload.
    pub const DATA: u8 = 0x05;
}

/// A peer is considered gone after this much silence.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);
/// Keepalive interval while a link is idle.
const PING_INTERVAL: Duration = Duration::from_secs(1);
/// Unanswered CONNECT datagrams are resent at this interval.
const CONNECT_RESEND: Duration = Duration::from_millis(200);

fn encode_frame(kind: u8, channel: u8, payload: &[u8], checksum: Option<ChecksumFn>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len() + 4);
    frame.push(kind);
    frame.push(channel);
    frame.extend_from_slice(payload);
    if let Some(f) = checksum {
        let crc = f(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
    }
    frame
}

fn decode_frame(data: &[u8], checksum: Option<ChecksumFn>) -> Option<(u8, u8, &[u8])> {
    let body = match checksum {
        Some(f) => {
            if data.len() < FRAME_HEADER + 4 {
                return None;
            }
            let (body, trailer) = data.split_at(data.len() - 4);
            let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
            let actual = f(body);
            if actual != expected {
                warn!(expected, actual, "dropping datagram with bad checksum");
                return None;
            }
            body
        }
        None => {
            if data.len() < FRAME_HEADER {
                return None;
            }
            data
        }
    };
    Some((body[0], body[1], &body[FRAME_HEADER..]))
}

/// Nothing arrived within the read timeout.
fn is_idle(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// ICMP unreachable surfaced on the socket; the peer may still appear.
fn is_unreachable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
    )
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| LinkError::InvalidAddress(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| LinkError::InvalidAddress(format!("{host}:{port} resolved to nothing")))
}

/// Opens [`UdpClientTransport`]s. Hand an instance to
/// [`NetClient`](crate::io::NetClient).
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpConnector;

impl ClientConnector for UdpConnector {
    fn connect(&self, config: &ClientConfig) -> Result<Box<dyn ClientTransport>> {
        Ok(Box::new(UdpClientTransport::connect(config)?))
    }
}

/// Opens [`UdpServerTransport`]s. Hand an instance to
/// [`NetServer`](crate::io::NetServer).
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpListener;

impl ServerListener for UdpListener {
    fn listen(&self, config: &ServerConfig) -> Result<Box<dyn ServerTransport>> {
        Ok(Box::new(UdpServerTransport::bind(config)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Connected,
    Closed,
}

/// Client half of the UDP transport.
pub struct UdpClientTransport {
    socket: UdpSocket,
    server_addr: SocketAddr,
    state: LinkState,
    pending: VecDeque<TransportEvent>,
    checksum: Option<ChecksumFn>,
    recv_buf: Vec<u8>,
    last_heard: Instant,
    last_sent: Instant,
}

impl UdpClientTransport {
    /// Bind a local socket and begin the handshake with the server
    /// named by `config`. The `Connect` event arrives asynchronously
    /// through `service` once the server accepts.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        let server_addr = resolve(&config.host, config.port)?;
        let local: SocketAddr = if server_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(server_addr)?;
        debug!(server = %server_addr, local = %socket.local_addr()?, "udp client connecting");

        let now = Instant::now();
        let mut transport = UdpClientTransport {
            socket,
            server_addr,
            state: LinkState::Connecting,
            pending: VecDeque::new(),
            checksum: None,
            recv_buf: vec![0u8; MAX_UDP_DATAGRAM_SIZE],
            last_heard: now,
            last_sent: now,
        };
        transport.send_control(kind::CONNECT)?;
        Ok(transport)
    }

    /// Local address of the bound socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn send_control(&mut self, kind: u8) -> Result<()> {
        let frame = encode_frame(kind, 0, &[], self.checksum);
        self.socket.send(&frame)?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn handle_datagram(&mut self, data: &[u8]) {
        let Some((kind, channel, payload)) = decode_frame(data, self.checksum) else {
            return;
        };
        self.last_heard = Instant::now();
        match kind {
            kind::ACCEPT => {
                if self.state == LinkState::Connecting {
                    self.state = LinkState::Connected;
                    self.pending.push_back(TransportEvent::Connect {
                        peer: 0,
                        addr: self.server_addr,
                    });
                }
            }
            kind::DISCONNECT => {
                if self.state != LinkState::Closed {
                    self.state = LinkState::Closed;
                    self.pending.push_back(TransportEvent::Disconnect { peer: 0 });
                }
            }
            kind::PING => {}
            kind::DATA => {
                if self.state == LinkState::Connected {
                    self.pending.push_back(TransportEvent::Receive {
                        peer: 0,
                        channel,
                        payload: Bytes::copy_from_slice(payload),
                    });
                }
            }
            other => trace!(kind = other, "ignoring datagram with unknown kind"),
        }
    }

    fn housekeeping(&mut self) {
        let now = Instant::now();
        match self.state {
            LinkState::Connecting => {
                if now.duration_since(self.last_heard) > INACTIVITY_TIMEOUT {
                    self.state = LinkState::Closed;
                    self.pending.push_back(TransportEvent::Timeout { peer: 0 });
                } else if now.duration_since(self.last_sent) > CONNECT_RESEND {
                    let _ = self.send_control(kind::CONNECT);
                }
            }
            LinkState::Connected => {
                if now.duration_since(self.last_heard) > INACTIVITY_TIMEOUT {
                    self.state = LinkState::Closed;
                    self.pending.push_back(TransportEvent::Timeout { peer: 0 });
                } else if now.duration_since(self.last_sent) > PING_INTERVAL {
                    let _ = self.send_control(kind::PING);
                }
            }
            LinkState::Closed => {}
        }
    }
}

impl ClientTransport for UdpClientTransport {
    fn check_event(&mut self) -> Option<TransportEvent> {
        self.pending.pop_front()
    }

    fn service(&mut self, timeout: Duration) -> Result<Option<TransportEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.housekeeping();
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).max(Duration::from_millis(1));
            self.socket.set_read_timeout(Some(wait))?;

            match self.socket.recv(&mut self.recv_buf) {
                Ok(n) => {
                    let datagram = self.recv_buf[..n].to_vec();
                    self.handle_datagram(&datagram);
                }
                Err(e) if is_idle(&e) => {
                    self.housekeeping();
                    return Ok(self.pending.pop_front());
                }
                Err(e) if is_unreachable(&e) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send(&mut self, channel: u8, payload: &[u8], _delivery: Delivery) -> Result<()> {
        if self.state != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        if payload.len() > MAX_UDP_DATAGRAM_SIZE - FRAME_HEADER - 4 {
            return Err(LinkError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_UDP_DATAGRAM_SIZE - FRAME_HEADER - 4,
            });
        }
        let frame = encode_frame(kind::DATA, channel, payload, self.checksum);
        self.socket.send(&frame)?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn set_checksum(&mut self, checksum: Option<ChecksumFn>) {
        self.checksum = checksum;
    }

    fn flush(&mut self) {
        // datagrams go straight to the socket; nothing is buffered
    }

    fn disconnect(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        let _ = self.send_control(kind::DISCONNECT);
        self.state = LinkState::Closed;
        trace!("udp client disconnected");
    }
}

struct UdpPeer {
    addr: SocketAddr,
    last_heard: Instant,
    last_sent: Instant,
}

/// Server half of the UDP transport: a bound socket plus a fixed table
/// of peer slots sized by `max_clients`.
pub struct UdpServerTransport {
    socket: UdpSocket,
    peers: Vec<Option<UdpPeer>>,
    by_addr: HashMap<SocketAddr, PeerId>,
    pending: VecDeque<TransportEvent>,
    checksum: Option<ChecksumFn>,
    recv_buf: Vec<u8>,
}

impl UdpServerTransport {
    /// Bind the address and port named by `config`.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let addr = resolve(config.effective_bind_address(), config.port)?;
        let socket = UdpSocket::bind(addr)?;
        debug!(
            local = %socket.local_addr()?,
            max_clients = config.max_clients,
            "udp server listening"
        );
        Ok(UdpServerTransport {
            socket,
            peers: (0..config.max_clients).map(|_| None).collect(),
            by_addr: HashMap::new(),
            pending: VecDeque::new(),
            checksum: None,
            recv_buf: vec![0u8; MAX_UDP_DATAGRAM_SIZE],
        })
    }

    /// Local address of the bound socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn send_control_to(&self, addr: SocketAddr, kind: u8) {
        let frame = encode_frame(kind, 0, &[], self.checksum);
        if let Err(e) = self.socket.send_to(&frame, addr) {
            trace!(peer = %addr, error = %e, "control datagram failed");
        }
    }

    fn accept(&mut self, addr: SocketAddr) {
        if let Some(&peer) = self.by_addr.get(&addr) {
            // duplicate CONNECT: the ACCEPT was lost, resend it
            self.send_control_to(addr, kind::ACCEPT);
            if let Some(entry) = self.peers[peer as usize].as_mut() {
                entry.last_heard = Instant::now();
            }
            return;
        }

        let Some(slot) = self.peers.iter().position(|p| p.is_none()) else {
            debug!(peer = %addr, "refusing connect, server full");
            self.send_control_to(addr, kind::DISCONNECT);
            return;
        };

        let now = Instant::now();
        self.peers[slot] = Some(UdpPeer {
            addr,
            last_heard: now,
            last_sent: now,
        });
        self.by_addr.insert(addr, slot as PeerId);
        self.send_control_to(addr, kind::ACCEPT);
        self.pending.push_back(TransportEvent::Connect {
            peer: slot as PeerId,
            addr,
        });
        debug!(peer = slot, addr = %addr, "udp peer connected");
    }

    fn drop_peer(&mut self, peer: PeerId) -> Option<UdpPeer> {
        let entry = self.peers.get_mut(peer as usize)?.take()?;
        self.by_addr.remove(&entry.addr);
        Some(entry)
    }

    fn handle_datagram(&mut self, addr: SocketAddr, data: &[u8]) {
        let Some((kind, channel, payload)) = decode_frame(data, self.checksum) else {
            return;
        };
        match kind {
            kind::CONNECT => self.accept(addr),
            kind::DISCONNECT => {
                let peer = self.by_addr.get(&addr).copied();
                if let Some(peer) = peer {
                    self.drop_peer(peer);
                    self.pending.push_back(TransportEvent::Disconnect { peer });
                }
            }
            kind::PING => {
                if let Some(&peer) = self.by_addr.get(&addr) {
                    if let Some(entry) = self.peers[peer as usize].as_mut() {
                        entry.last_heard = Instant::now();
                    }
                }
            }
            kind::DATA => {
                if let Some(&peer) = self.by_addr.get(&addr) {
                    if let Some(entry) = self.peers[peer as usize].as_mut() {
                        entry.last_heard = Instant::now();
                    }
                    self.pending.push_back(TransportEvent::Receive {
                        peer,
                        channel,
                        payload: Bytes::copy_from_slice(payload),
                    });
                }
            }
            other => trace!(kind = other, "ignoring datagram with unknown kind"),
        }
    }

    fn housekeeping(&mut self) {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        let mut idle = Vec::new();
        for (slot, entry) in self.peers.iter_mut().enumerate() {
            if let Some(peer) = entry {
                if now.duration_since(peer.last_heard) > INACTIVITY_TIMEOUT {
                    timed_out.push(slot as PeerId);
                } else if now.duration_since(peer.last_sent) > PING_INTERVAL {
                    peer.last_sent = now;
                    idle.push(peer.addr);
                }
            }
        }
        for addr in idle {
            self.send_control_to(addr, kind::PING);
        }
        for peer in timed_out {
            self.drop_peer(peer);
            self.pending.push_back(TransportEvent::Timeout { peer });
            debug!(peer, "udp peer timed out");
        }
    }

    fn send_data(&mut self, peer: PeerId, channel: u8, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_UDP_DATAGRAM_SIZE - FRAME_HEADER - 4 {
            return Err(LinkError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_UDP_DATAGRAM_SIZE - FRAME_HEADER - 4,
            });
        }
        let addr = self
            .peers
            .get(peer as usize)
            .and_then(|p| p.as_ref())
            .map(|p| p.addr)
            .ok_or(LinkError::NotConnected)?;
        let frame = encode_frame(kind::DATA, channel, payload, self.checksum);
        self.socket.send_to(&frame, addr)?;
        if let Some(entry) = self.peers[peer as usize].as_mut() {
            entry.last_sent = Instant::now();
        }
        Ok(())
    }
}

impl ServerTransport for UdpServerTransport {
    fn check_event(&mut self) -> Option<TransportEvent> {
        self.pending.pop_front()
    }

    fn service(&mut self, timeout: Duration) -> Result<Option<TransportEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.housekeeping();
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).max(Duration::from_millis(1));
            self.socket.set_read_timeout(Some(wait))?;

            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((n, addr)) => {
                    let datagram = self.recv_buf[..n].to_vec();
                    self.handle_datagram(addr, &datagram);
                }
                Err(e) if is_idle(&e) => {
                    self.housekeeping();
                    return Ok(self.pending.pop_front());
                }
                Err(e) if is_unreachable(&e) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send(&mut self, peer: PeerId, channel: u8, payload: &[u8], _delivery: Delivery) -> Result<()> {
        self.send_data(peer, channel, payload)
    }

    fn broadcast(&mut self, channel: u8, payload: &[u8], _delivery: Delivery) -> Result<()> {
        let peers: Vec<PeerId> = self
            .peers
            .iter()
            .enumerate()
            .filter_map(|(slot, p)| p.as_ref().map(|_| slot as PeerId))
            .collect();
        for peer in peers {
            self.send_data(peer, channel, payload)?;
        }
        Ok(())
    }

    fn broadcast_to(
        &mut self,
        peers: &[PeerId],
        channel: u8,
        payload: &[u8],
        _delivery: Delivery,
    ) -> Result<()> {
        for &peer in peers {
            self.send_data(peer, channel, payload)?;
        }
        Ok(())
    }

    fn set_checksum(&mut self, checksum: Option<ChecksumFn>) {
        self.checksum = checksum;
    }

    fn flush(&mut self) {
        // datagrams go straight to the socket; nothing is buffered
    }

    fn disconnect(&mut self, peer: PeerId) {
        if let Some(entry) = self.drop_peer(peer) {
            self.send_control_to(entry.addr, kind::DISCONNECT);
            trace!(peer, "udp server disconnected peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc;

    fn wait_event<F>(mut service: F) -> Option<TransportEvent>
    where
        F: FnMut(Duration) -> Result<Option<TransportEvent>>,
    {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if let Some(event) = service(Duration::from_millis(50)).unwrap() {
                return Some(event);
            }
        }
        None
    }

    fn handshaken() -> (UdpServerTransport, UdpClientTransport) {
        let mut server = UdpServerTransport::bind(&ServerConfig::new(0, 4)).unwrap();
        let port = server.local_addr().unwrap().port();
        let mut client =
            UdpClientTransport::connect(&ClientConfig::new("127.0.0.1", port)).unwrap();

        let event = wait_event(|t| server.service(t)).expect("server saw no connect");
        assert!(matches!(event, TransportEvent::Connect { peer: 0, .. }));
        let event = wait_event(|t| client.service(t)).expect("client saw no accept");
        assert!(matches!(event, TransportEvent::Connect { peer: 0, .. }));
        (server, client)
    }

    #[test]
    fn test_frame_roundtrip_without_checksum() {
        let frame = encode_frame(kind::DATA, 3, b"payload", None);
        let (k, channel, payload) = decode_frame(&frame, None).unwrap();
        assert_eq!(k, kind::DATA);
        assert_eq!(channel, 3);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_frame_roundtrip_with_checksum() {
        let frame = encode_frame(kind::DATA, 1, b"abc", Some(crc::checksum));
        let (k, channel, payload) = decode_frame(&frame, Some(crc::checksum)).unwrap();
        assert_eq!((k, channel, payload), (kind::DATA, 1, &b"abc"[..]));
    }

    #[test]
    fn test_frame_rejects_corruption() {
        let mut frame = encode_frame(kind::DATA, 1, b"abc", Some(crc::checksum));
        frame[3] ^= 0xFF;
        assert!(decode_frame(&frame, Some(crc::checksum)).is_none());
    }

    #[test]
    fn test_frame_rejects_runt() {
        assert!(decode_frame(&[kind::DATA], None).is_none());
        assert!(decode_frame(&[1, 2, 3], Some(crc::checksum)).is_none());
    }

    #[test]
    fn test_handshake_and_data_roundtrip() {
        let (mut server, mut client) = handshaken();

        client.send(2, b"ping over udp", Delivery::Unreliable).unwrap();
        match wait_event(|t| server.service(t)).expect("no data at server") {
            TransportEvent::Receive { peer: 0, channel: 2, payload } => {
                assert_eq!(payload.as_ref(), b"ping over udp");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        server.send(0, 1, b"pong", Delivery::Unreliable).unwrap();
        match wait_event(|t| client.service(t)).expect("no data at client") {
            TransportEvent::Receive { channel: 1, payload, .. } => {
                assert_eq!(payload.as_ref(), b"pong");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_disconnect_reaches_server() {
        let (mut server, mut client) = handshaken();
        client.disconnect();
        let event = wait_event(|t| server.service(t)).expect("no disconnect at server");
        assert!(matches!(event, TransportEvent::Disconnect { peer: 0 }));
    }

    #[test]
    fn test_send_before_handshake_fails() {
        let server = UdpServerTransport::bind(&ServerConfig::new(0, 4)).unwrap();
        let port = server.local_addr().unwrap().port();
        let mut client =
            UdpClientTransport::connect(&ClientConfig::new("127.0.0.1", port)).unwrap();
        assert!(matches!(
            client.send(0, b"early", Delivery::Reliable),
            Err(LinkError::NotConnected)
        ));
    }

    #[test]
    fn test_server_full_refuses_extra_peer() {
        let mut server = UdpServerTransport::bind(&ServerConfig::new(0, 1)).unwrap();
        let port = server.local_addr().unwrap().port();

        let mut first = UdpClientTransport::connect(&ClientConfig::new("127.0.0.1", port)).unwrap();
        assert!(wait_event(|t| server.service(t)).is_some());
        assert!(wait_event(|t| first.service(t)).is_some());

        let mut second =
            UdpClientTransport::connect(&ClientConfig::new("127.0.0.1", port)).unwrap();
        // the server answers the CONNECT with a refusal DISCONNECT, but
        // only while being serviced; pump both ends
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut refused = None;
        while refused.is_none() && Instant::now() < deadline {
            let _ = server.service(Duration::from_millis(10)).unwrap();
            refused = second.service(Duration::from_millis(10)).unwrap();
        }
        match refused.expect("refused client saw nothing") {
            TransportEvent::Disconnect { .. } | TransportEvent::Timeout { .. } => {}
            other => panic!("server over capacity: {other:?}"),
        }
        assert!(matches!(
            second.send(0, b"x", Delivery::Reliable),
            Err(LinkError::NotConnected)
        ));
    }

    #[test]
    fn test_invalid_host_rejected() {
        let result = UdpClientTransport::connect(&ClientConfig::new("definitely not a host", 1));
        assert!(matches!(result, Err(LinkError::InvalidAddress(_))));
    }
}
