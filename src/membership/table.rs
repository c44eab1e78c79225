// Membership Table
//
// The authoritative local view of the cluster. Applies the SWIM
// conflict-resolution rules:
// - A higher incarnation always replaces the current entry.
// - At equal incarnations, only a strictly greater status
//   (alive < suspect < faulty) replaces the current one.
// - Lower incarnations are ignored.
//
// Reports that would mark the local member suspect or faulty are refuted
// instead: the local incarnation jumps past the report and the member stays
// alive. Suspect entries carry a deadline; the sweep promotes expired
// suspects to faulty and evicts faulty entries one protocol period later.

use crate::membership::{Incarnation, MemberId, MemberStatus, MembershipEvent};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Per-member table entry
#[derive(Debug, Clone)]
struct MemberEntry {
    status: MemberStatus,
    incarnation: Incarnation,

    /// Set iff status is suspect
    suspicion_deadline: Option<Instant>,

    /// Set iff status is faulty
    evict_at: Option<Instant>,
}

/// The local membership table.
///
/// The local member is always implicitly present and alive; `entries` holds
/// everyone else. All mutations return the membership events they produced
/// (zero or one) so the caller can forward them to the event sink and the
/// dissemination queue.
#[derive(Debug)]
pub struct MembershipTable {
    local: MemberId,
    local_incarnation: Incarnation,
    protocol_period: Duration,
    suspicion_mult: u32,
    entries: HashMap<MemberId, MemberEntry>,
}

impl MembershipTable {
    /// Create a table for the given local identity
    pub fn new(local: MemberId, protocol_period: Duration, suspicion_mult: u32) -> Self {
        Self {
            local,
            local_incarnation: 0,
            protocol_period,
            suspicion_mult,
            entries: HashMap::new(),
        }
    }

    /// The configured local identity
    pub fn local_member(&self) -> MemberId {
        self.local
    }

    /// The local member's current incarnation
    pub fn local_incarnation(&self) -> Incarnation {
        self.local_incarnation
    }

    /// Cluster size as known locally, including the local member
    pub fn cluster_size(&self) -> usize {
        self.entries.len() + 1
    }

    /// Snapshot of all non-local entries not yet evicted
    pub fn members(&self) -> Vec<(MemberId, MemberStatus, Incarnation)> {
        self.entries
            .iter()
            .map(|(member, entry)| (*member, entry.status, entry.incarnation))
            .collect()
    }

    /// Non-local, non-faulty members with their current incarnations.
    /// This is the pool the detector samples a probe round from.
    pub fn probe_candidates(&self) -> Vec<(MemberId, Incarnation)> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.status.is_faulty())
            .map(|(member, entry)| (*member, entry.incarnation))
            .collect()
    }

    /// Whether the member is still a valid probe target
    pub fn is_probeable(&self, member: &MemberId) -> bool {
        self.entries
            .get(member)
            .map_or(false, |entry| !entry.status.is_faulty())
    }

    /// Current incarnation of a member, if known
    pub fn incarnation_of(&self, member: &MemberId) -> Option<Incarnation> {
        if *member == self.local {
            return Some(self.local_incarnation);
        }
        self.entries.get(member).map(|entry| entry.incarnation)
    }

    /// Apply an `alive@inc` report
    pub fn alive(&mut self, peer: MemberId, incarnation: Incarnation) -> Vec<MembershipEvent> {
        self.apply(peer, MemberStatus::Alive, incarnation)
    }

    /// Apply a `suspect@inc` report
    pub fn suspect(&mut self, peer: MemberId, incarnation: Incarnation) -> Vec<MembershipEvent> {
        self.apply(peer, MemberStatus::Suspect, incarnation)
    }

    /// Apply a `faulty@inc` report
    pub fn faulty(&mut self, peer: MemberId, incarnation: Incarnation) -> Vec<MembershipEvent> {
        self.apply(peer, MemberStatus::Faulty, incarnation)
    }

    /// Local status override at the member's current incarnation. Subject
    /// to the same status ordering as remote reports, so a fresher report
    /// that already advanced the incarnation wins.
    pub fn set_status(&mut self, peer: MemberId, status: MemberStatus) -> Vec<MembershipEvent> {
        match self.incarnation_of(&peer) {
            Some(incarnation) => self.apply(peer, status, incarnation),
            None => Vec::new(),
        }
    }

    /// Suspicion timeout scaled to the known cluster size:
    /// `protocol_period * ceil(log2(k + 1)) * suspicion_mult`
    pub fn suspicion_timeout(&self) -> Duration {
        let k = self.cluster_size() as f64;
        let rounds = (k + 1.0).log2().ceil() as u32;
        self.protocol_period * rounds.max(1) * self.suspicion_mult
    }

    /// Promote suspects whose deadline has passed to faulty, and evict
    /// faulty entries whose grace period has expired.
    pub fn sweep(&mut self) -> Vec<MembershipEvent> {
        let now = Instant::now();
        let mut events = Vec::new();

        for (member, entry) in self.entries.iter_mut() {
            if entry.status != MemberStatus::Suspect {
                continue;
            }
            let expired = entry.suspicion_deadline.map_or(false, |d| now >= d);
            if expired {
                entry.status = MemberStatus::Faulty;
                entry.suspicion_deadline = None;
                entry.evict_at = Some(now + self.protocol_period);
                tracing::error!(member = %member, incarnation = entry.incarnation, "Member confirmed faulty");
                events.push(MembershipEvent::StatusChanged {
                    member: *member,
                    old: MemberStatus::Suspect,
                    new: MemberStatus::Faulty,
                    incarnation: entry.incarnation,
                });
            }
        }

        let evicted: Vec<MemberId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.evict_at.map_or(false, |at| now >= at))
            .map(|(member, _)| *member)
            .collect();
        for member in evicted {
            self.entries.remove(&member);
            tracing::debug!(member = %member, "Member evicted");
            events.push(MembershipEvent::MemberEvicted { member });
        }

        events
    }

    fn apply(
        &mut self,
        peer: MemberId,
        status: MemberStatus,
        incarnation: Incarnation,
    ) -> Vec<MembershipEvent> {
        if peer == self.local {
            return self.apply_local(status, incarnation);
        }

        let now = Instant::now();
        let suspicion_timeout = self.suspicion_timeout();
        let protocol_period = self.protocol_period;
        match self.entries.get_mut(&peer) {
            None => {
                // Only an alive report introduces a member. Suspicion or
                // death of a peer we never saw alive has nothing to
                // supersede and would plant a phantom entry.
                if status != MemberStatus::Alive {
                    return Vec::new();
                }
                self.entries.insert(
                    peer,
                    MemberEntry {
                        status,
                        incarnation,
                        suspicion_deadline: None,
                        evict_at: None,
                    },
                );
                tracing::debug!(member = %peer, ?status, incarnation, "Member joined");
                vec![MembershipEvent::MemberJoined {
                    member: peer,
                    status,
                    incarnation,
                }]
            }
            Some(entry) => {
                let supersedes = incarnation > entry.incarnation
                    || (incarnation == entry.incarnation && status > entry.status);
                if !supersedes {
                    return Vec::new();
                }

                let old = entry.status;
                entry.incarnation = incarnation;
                entry.status = status;
                entry.suspicion_deadline =
                    (status == MemberStatus::Suspect).then(|| now + suspicion_timeout);
                entry.evict_at = (status == MemberStatus::Faulty).then(|| now + protocol_period);

                if old == status {
                    // Incarnation-only refresh
                    return Vec::new();
                }

                match status {
                    MemberStatus::Suspect => {
                        tracing::warn!(member = %peer, incarnation, "Member suspected")
                    }
                    MemberStatus::Faulty => {
                        tracing::error!(member = %peer, incarnation, "Member faulty")
                    }
                    MemberStatus::Alive => {
                        tracing::debug!(member = %peer, incarnation, "Member recovered")
                    }
                }
                vec![MembershipEvent::StatusChanged {
                    member: peer,
                    old,
                    new: status,
                    incarnation,
                }]
            }
        }
    }

    /// Reports about the local member. Alive reports at a higher
    /// incarnation just advance the counter; suspicion is refuted by
    /// jumping the incarnation past the report.
    fn apply_local(
        &mut self,
        status: MemberStatus,
        incarnation: Incarnation,
    ) -> Vec<MembershipEvent> {
        match status {
            MemberStatus::Alive => {
                self.local_incarnation = self.local_incarnation.max(incarnation);
                Vec::new()
            }
            MemberStatus::Suspect | MemberStatus::Faulty => {
                if incarnation < self.local_incarnation {
                    // Already superseded by our own alive broadcast
                    return Vec::new();
                }
                self.local_incarnation = self.local_incarnation.max(incarnation) + 1;
                tracing::warn!(
                    incarnation = self.local_incarnation,
                    "Refuted suspicion about local member"
                );
                vec![MembershipEvent::LocalRefuted {
                    incarnation: self.local_incarnation,
                }]
            }
        }
    }
}
