// Cluster Membership
//
// This module holds the authoritative local view of the cluster:
// - Member identity, status, and incarnation types
// - The membership table with SWIM conflict resolution (table)
// - The piggyback rebroadcast queue for gossip dissemination (dissemination)
//
// Reference: "SWIM: Scalable Weakly-consistent Infection-style Process Group
// Membership Protocol" (Das et al., 2002)

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub mod dissemination;
pub mod table;

// Re-exports for convenience
pub use dissemination::DisseminationQueue;
pub use table::MembershipTable;

/// Peer identity on the gossip mesh
pub type MemberId = SocketAddr;

/// Monotonic per-member counter used to resolve conflicting reports.
/// Only the owning member may increment its own incarnation.
pub type Incarnation = u64;

/// Member status.
///
/// The derived ordering (`Alive < Suspect < Faulty`) is load-bearing: at
/// equal incarnations, only a strictly greater status may replace the
/// current one.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum MemberStatus {
    /// Member is responding to probes
    Alive,

    /// Member missed a probe round and is under suspicion
    Suspect,

    /// Member is confirmed dead and awaiting eviction
    Faulty,
}

impl MemberStatus {
    /// Check if the status is alive
    pub fn is_alive(&self) -> bool {
        matches!(self, MemberStatus::Alive)
    }

    /// Check if the status is faulty
    pub fn is_faulty(&self) -> bool {
        matches!(self, MemberStatus::Faulty)
    }
}

/// A single membership report piggybacked on protocol datagrams
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct GossipUpdate {
    /// Reported status
    pub status: MemberStatus,

    /// Member the report is about
    pub member: MemberId,

    /// Incarnation the report was issued at
    pub incarnation: Incarnation,
}

/// Membership events emitted by table mutations.
///
/// These feed the external dissemination channel. Delivery is
/// at-least-once; consumers must be idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    /// A member was seen for the first time
    MemberJoined {
        member: MemberId,
        status: MemberStatus,
        incarnation: Incarnation,
    },

    /// A member changed status
    StatusChanged {
        member: MemberId,
        old: MemberStatus,
        new: MemberStatus,
        incarnation: Incarnation,
    },

    /// A faulty member left the table after its grace period
    MemberEvicted { member: MemberId },

    /// The local member refuted a suspicion about itself by bumping its
    /// incarnation
    LocalRefuted { incarnation: Incarnation },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering() {
        assert!(MemberStatus::Alive < MemberStatus::Suspect);
        assert!(MemberStatus::Suspect < MemberStatus::Faulty);
    }

    #[test]
    fn test_status_checks() {
        assert!(MemberStatus::Alive.is_alive());
        assert!(!MemberStatus::Suspect.is_alive());
        assert!(MemberStatus::Faulty.is_faulty());
    }
}
