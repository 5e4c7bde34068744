//! Transport layer seam
//!
//! The session engine treats the wire as a black box behind these
//! traits: something that can connect or listen, report events, and
//! move byte payloads per peer and channel. Sequencing, retransmission
//! and congestion control are the transport's own business.
//!
//! Two implementations ship with the crate: [`memory`] keeps client and
//! server in one process (tests, singleplayer), [`udp`] is a
//! best-effort datagram transport. ENet-class reliable-UDP libraries
//! slot in behind the same traits.

pub mod memory;
pub mod udp;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::config::{ClientConfig, ServerConfig};
use crate::error::Result;

/// Peer identifier assigned by the transport.
///
/// Small slot index: servers size their peer table by `max_clients` and
/// transports must keep ids below that bound for connected peers.
pub type PeerId = u32;

/// Checksum function installable on a transport host.
pub type ChecksumFn = fn(&[u8]) -> u32;

/// Delivery mode requested for one send.
///
/// Reliability is delegated to the transport; transports without a
/// reliability layer treat `Reliable` as best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fire-and-forget; may be lost or reordered
    Unreliable,
    /// Delivered and ordered if the transport supports it
    Reliable,
}

/// One event reported by a transport host.
///
/// Payload buffers are owned [`Bytes`]: whoever consumes the event
/// releases the buffer by dropping it, on every path.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer completed its connection handshake
    Connect {
        /// Transport-assigned peer id
        peer: PeerId,
        /// Remote address of the peer
        addr: SocketAddr,
    },
    /// A peer disconnected gracefully
    Disconnect {
        /// Transport-assigned peer id
        peer: PeerId,
    },
    /// A peer went silent past the transport's inactivity limit
    Timeout {
        /// Transport-assigned peer id
        peer: PeerId,
    },
    /// A payload arrived from a peer
    Receive {
        /// Transport-assigned peer id
        peer: PeerId,
        /// Channel the payload was sent on
        channel: u8,
        /// The payload bytes, released when dropped
        payload: Bytes,
    },
}

/// Client-side transport host: one connection to one remote peer.
pub trait ClientTransport: Send {
    /// Return an already-pending event without touching the wire.
    fn check_event(&mut self) -> Option<TransportEvent>;

    /// Block up to `timeout` waiting for one event.
    ///
    /// Returns `Ok(None)` on an idle tick; that is normal, not an
    /// error. The timeout bounds how long a stopping session waits
    /// before it re-checks its running flag.
    fn service(&mut self, timeout: Duration) -> Result<Option<TransportEvent>>;

    /// Queue a payload to the remote peer.
    fn send(&mut self, channel: u8, payload: &[u8], delivery: Delivery) -> Result<()>;

    /// Install or remove a checksum validated on every datagram.
    fn set_checksum(&mut self, checksum: Option<ChecksumFn>);

    /// Push any internally buffered sends onto the wire.
    fn flush(&mut self);

    /// Gracefully disconnect from the remote peer.
    fn disconnect(&mut self);
}

/// Server-side transport host: a table of connected peers.
pub trait ServerTransport: Send {
    /// Return an already-pending event without touching the wire.
    fn check_event(&mut self) -> Option<TransportEvent>;

    /// Block up to `timeout` waiting for one event. `Ok(None)` on an
    /// idle tick.
    fn service(&mut self, timeout: Duration) -> Result<Option<TransportEvent>>;

    /// Queue a payload to one peer.
    fn send(&mut self, peer: PeerId, channel: u8, payload: &[u8], delivery: Delivery)
        -> Result<()>;

    /// Queue a payload to every connected peer.
    fn broadcast(&mut self, channel: u8, payload: &[u8], delivery: Delivery) -> Result<()>;

    /// Queue a payload to each peer in `peers`. The caller has already
    /// resolved the set; every id refers to a connected peer.
    fn broadcast_to(
        &mut self,
        peers: &[PeerId],
        channel: u8,
        payload: &[u8],
        delivery: Delivery,
    ) -> Result<()>;

    /// Install or remove a checksum validated on every datagram.
    fn set_checksum(&mut self, checksum: Option<ChecksumFn>);

    /// Push any internally buffered sends onto the wire.
    fn flush(&mut self);

    /// Gracefully disconnect one peer.
    fn disconnect(&mut self, peer: PeerId);
}

/// Opens a [`ClientTransport`] for a session.
///
/// Called on the network thread, so connection failures surface through
/// the session's running flag rather than from `start`.
pub trait ClientConnector: Send + Sync + 'static {
    /// Connect to the host and port named by `config`.
    fn connect(&self, config: &ClientConfig) -> Result<Box<dyn ClientTransport>>;
}

/// Opens a [`ServerTransport`] for a session.
///
/// Called on the network thread, so bind failures surface through the
/// session's running flag rather than from `start`.
pub trait ServerListener: Send + Sync + 'static {
    /// Listen on the address and port named by `config`.
    fn listen(&self, config: &ServerConfig) -> Result<Box<dyn ServerTransport>>;
}
