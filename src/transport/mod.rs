// Datagram Transport
//
// Encoding, authenticated framing, and UDP delivery for protocol messages:
// - Wire format: tagged messages with bounded piggyback lists (wire)
// - UDP socket ownership and keyring framing (udp)
//
// Transport failures are never surfaced to the protocol: sends that fail
// and datagrams that fail verification or parsing are counted and dropped.

use std::sync::atomic::{AtomicU64, Ordering};

pub mod udp;
pub mod wire;

// Re-exports for convenience
pub use udp::UdpTransport;
pub use wire::GossipMessage;

/// Transport counters. Dropped traffic is visible here and nowhere else.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub datagrams_sent: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub send_errors: AtomicU64,
    pub failed_verifications: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub stale_acks: AtomicU64,
}

/// Point-in-time copy of the transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub send_errors: u64,
    pub failed_verifications: u64,
    pub malformed_messages: u64,
    pub stale_acks: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            failed_verifications: self.failed_verifications.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            stale_acks: self.stale_acks.load(Ordering::Relaxed),
        }
    }
}
