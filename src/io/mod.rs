//! Session layer: the application-facing endpoints
//!
//! A session owns its configuration, the four bounded queues, the
//! reusable scratch buffers and the network thread that drives the
//! transport. [`NetClient`] talks to one server; [`NetServer`] keeps a
//! peer table and adds broadcast routing.

pub mod client;
pub mod server;

pub use client::NetClient;
pub use server::NetServer;

use std::time::Duration;

use bytes::Bytes;

use crate::transport::PeerId;

/// How long the network thread blocks in `service` when no events are
/// pending. Bounds shutdown latency: the running flag is re-checked at
/// least this often.
pub(crate) const SERVICE_TIMEOUT: Duration = Duration::from_millis(15);

/// Fixed capacity of the connection and disconnection queues.
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 1024;

/// A received payload parked between the network thread and `update`.
///
/// Dropping it on any path (oversized discard, queue rejection, normal
/// copy-out) is the one release of the transport-owned buffer.
pub(crate) struct IncomingPacket {
    pub(crate) peer: PeerId,
    pub(crate) channel: u8,
    pub(crate) payload: Bytes,
}

/// Put a taken listener list back, keeping listeners registered from
/// inside a callback behind the pre-existing ones.
pub(crate) fn restore_listeners<T>(slot: &mut Vec<T>, mut taken: Vec<T>) {
    taken.append(slot);
    *slot = taken;
}
