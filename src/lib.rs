//! Real-time client/server packet messaging
//!
//! packetlink moves discrete typed packets between a client and a
//! server with bounded latency. Each session owns a dedicated network
//! thread that drives a pluggable reliable/unreliable transport; four
//! bounded queues hand connection, disconnection and packet events
//! across threads without ever blocking the network loop; a cursor
//! codec frames application payloads behind a one-byte type tag.
//!
//! # Features
//!
//! - **Dedicated network thread** - transport I/O never runs on the
//!   application thread; `update()` dispatches queued events to
//!   listeners synchronously, where your game loop expects them
//! - **Bounded, fail-fast queues** - a full queue rejects and counts
//!   instead of stalling the network loop
//! - **Typed packets** - implement [`Packet`](protocol::Packet) once,
//!   route by the leading tag byte with
//!   [`PacketDispatcher`](protocol::PacketDispatcher)
//! - **Pluggable transports** - in-memory hub for tests and
//!   singleplayer, best-effort UDP out of the box, ENet-class
//!   reliable-UDP libraries behind the same traits
//!
//! # Quick Start
//!
//! **Server:**
//! ```no_run
//! use std::sync::Arc;
//! use packetlink::config::ServerConfig;
//! use packetlink::io::NetServer;
//! use packetlink::transport::udp::UdpListener;
//! use packetlink::transport::Delivery;
//!
//! let mut server = NetServer::new(ServerConfig::new(7777, 100), Arc::new(UdpListener));
//! server.on_client_connected(|_, peer, addr| {
//!     println!("peer {peer} connected from {addr}");
//! });
//! server.on_packet(|server, _, data, channel| {
//!     let copy = data.to_vec();
//!     server.broadcast_bytes(&copy, channel, Delivery::Reliable);
//! });
//! server.start();
//! loop {
//!     server.update();
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! ```
//!
//! **Client:**
//! ```no_run
//! use std::sync::Arc;
//! use packetlink::config::ClientConfig;
//! use packetlink::io::NetClient;
//! use packetlink::transport::udp::UdpConnector;
//! use packetlink::transport::Delivery;
//!
//! let mut client = NetClient::new(ClientConfig::new("127.0.0.1", 7777), Arc::new(UdpConnector));
//! client.on_connected(|client| {
//!     client.send_bytes(b"hello", 0, Delivery::Reliable);
//! });
//! client.start();
//! loop {
//!     client.update();
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! ```
//!
//! # Architecture
//!
//! - **`protocol`** - Pure data: the envelope codec
//!   ([`PacketWriter`](protocol::PacketWriter) /
//!   [`PacketReader`](protocol::PacketReader)), CRC-32 checksum, the
//!   [`Packet`](protocol::Packet) trait and tag dispatch
//! - **`transport`** - The seam to the wire:
//!   [`ClientTransport`](transport::ClientTransport) /
//!   [`ServerTransport`](transport::ServerTransport) plus the shipped
//!   [`memory`](transport::memory) and [`udp`](transport::udp)
//!   implementations
//! - **`io`** - The sessions: [`NetClient`](io::NetClient) and
//!   [`NetServer`](io::NetServer) with their network loops
//! - **`queue`** / **`stats`** / **`config`** / **`error`** - the
//!   bounded queues, drop counters, configuration and error type
//!
//! # Threading model
//!
//! Two execution contexts per session: your application thread calls
//! `send*`/`update`/`start`/`stop`; exactly one network thread drives
//! the transport. The four bounded queues are the only shared state
//! besides the running flag. `stop` blocks until the network thread
//! has joined; shutdown latency is bounded by the 15 ms transport
//! service timeout. Startup failures (unreachable host, port in use)
//! surface asynchronously through `is_running()`, never as a panic.
//!
//! # Delivery semantics
//!
//! Sends are fire-and-forget. Reliability for
//! [`Delivery::Reliable`](transport::Delivery) sends is delegated
//! entirely to the transport; payloads larger than the configured
//! maximum, sends to departed peers and selective broadcasts that
//! resolve to nobody are released without an error and show up in
//! [`stats()`](io::NetClient::stats) counters.

pub mod config;
pub mod error;
pub mod io;
pub mod protocol;
pub mod queue;
pub mod stats;
pub mod transport;

// Re-export commonly used types
pub use error::{LinkError, Result};
