//! Drop and rejection counters for a session
//!
//! Oversized payloads, invalid broadcast targets and queue overflows are
//! deliberately not errors on the hot path; they are counted here so
//! applications can observe discards instead of debugging silence.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters updated by both the application thread and the
/// network thread of one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub(crate) oversized_incoming: AtomicU64,
    pub(crate) oversized_outgoing: AtomicU64,
    pub(crate) queue_rejections: AtomicU64,
    pub(crate) invalid_targets: AtomicU64,
    pub(crate) empty_broadcasts: AtomicU64,
}

impl SessionStats {
    pub(crate) fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            oversized_incoming: self.oversized_incoming.load(Ordering::Relaxed),
            oversized_outgoing: self.oversized_outgoing.load(Ordering::Relaxed),
            queue_rejections: self.queue_rejections.load(Ordering::Relaxed),
            invalid_targets: self.invalid_targets.load(Ordering::Relaxed),
            empty_broadcasts: self.empty_broadcasts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a session's [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Received payloads larger than `max_packet_size`, released without
    /// invoking a callback
    pub oversized_incoming: u64,
    /// Queued sends larger than `max_packet_size`, released at flush
    /// time without touching the transport
    pub oversized_outgoing: u64,
    /// Items rejected by a full bounded queue
    pub queue_rejections: u64,
    /// Unicast or selective-broadcast ids that were out of range or
    /// pointed at an empty peer slot
    pub invalid_targets: u64,
    /// Selective broadcasts whose resolved target set was empty
    pub empty_broadcasts: u64,
}
