// Piggyback dissemination queue
//
// Membership updates ride on probe and ack datagrams instead of dedicated
// gossip traffic. Each update is retransmitted a bounded number of times,
// scaled to the cluster size, then retired. Selection prefers the
// least-transmitted updates so fresh news spreads first.

use crate::membership::{GossipUpdate, MemberId, MemberStatus, MembershipEvent};

#[derive(Debug, Clone)]
struct QueueEntry {
    update: GossipUpdate,
    transmits: u32,
}

/// Bounded rebroadcast queue for piggybacked membership updates
#[derive(Debug)]
pub struct DisseminationQueue {
    entries: Vec<QueueEntry>,
    retransmit_mult: u32,
}

impl DisseminationQueue {
    pub fn new(retransmit_mult: u32) -> Self {
        Self {
            entries: Vec::new(),
            retransmit_mult,
        }
    }

    /// Queue an update for dissemination. A fresher report about the same
    /// member replaces the queued one and restarts its transmit count;
    /// superseded reports are dropped.
    pub fn push(&mut self, update: GossipUpdate) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.update.member == update.member)
        {
            let supersedes = update.incarnation > entry.update.incarnation
                || (update.incarnation == entry.update.incarnation
                    && update.status > entry.update.status);
            if supersedes {
                entry.update = update;
                entry.transmits = 0;
            }
            return;
        }
        self.entries.push(QueueEntry {
            update,
            transmits: 0,
        });
    }

    /// Convert a membership event into its gossip form and queue it.
    /// Evictions carry no update: the faulty report that caused them has
    /// already been disseminated.
    pub fn observe_event(&mut self, event: &MembershipEvent, local: MemberId) {
        match event {
            MembershipEvent::MemberJoined {
                member,
                status,
                incarnation,
            } => self.push(GossipUpdate {
                status: *status,
                member: *member,
                incarnation: *incarnation,
            }),
            MembershipEvent::StatusChanged {
                member,
                new,
                incarnation,
                ..
            } => self.push(GossipUpdate {
                status: *new,
                member: *member,
                incarnation: *incarnation,
            }),
            MembershipEvent::LocalRefuted { incarnation } => self.push(GossipUpdate {
                status: MemberStatus::Alive,
                member: local,
                incarnation: *incarnation,
            }),
            MembershipEvent::MemberEvicted { .. } => {}
        }
    }

    /// Take up to `limit` updates for one outgoing datagram, preferring the
    /// least-transmitted ones. Updates that have reached their retransmit
    /// budget for a cluster of size `cluster_size` are retired.
    pub fn take(&mut self, limit: usize, cluster_size: usize) -> Vec<GossipUpdate> {
        let budget = self.transmit_budget(cluster_size);
        self.entries.retain(|e| e.transmits < budget);
        if self.entries.is_empty() {
            return Vec::new();
        }

        self.entries.sort_by_key(|e| e.transmits);
        let n = limit.min(self.entries.len());
        let mut out = Vec::with_capacity(n);
        for entry in self.entries.iter_mut().take(n) {
            out.push(entry.update);
            entry.transmits += 1;
        }
        out
    }

    /// Number of updates still queued
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn transmit_budget(&self, cluster_size: usize) -> u32 {
        let k = cluster_size.max(1) as f64;
        let rounds = (k + 1.0).log2().ceil() as u32;
        self.retransmit_mult * rounds.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> MemberId {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn update(port: u16, status: MemberStatus, incarnation: u64) -> GossipUpdate {
        GossipUpdate {
            status,
            member: addr(port),
            incarnation,
        }
    }

    #[test]
    fn test_take_prefers_least_transmitted() {
        let mut q = DisseminationQueue::new(4);
        q.push(update(1, MemberStatus::Alive, 0));
        let first = q.take(1, 8);
        assert_eq!(first.len(), 1);

        q.push(update(2, MemberStatus::Suspect, 0));
        let next = q.take(1, 8);
        assert_eq!(next[0].member, addr(2));
    }

    #[test]
    fn test_retirement_after_budget() {
        let mut q = DisseminationQueue::new(2);
        q.push(update(1, MemberStatus::Alive, 0));

        // Cluster of one: budget = 2 * ceil(log2(2)) = 2 transmits
        assert_eq!(q.take(4, 1).len(), 1);
        assert_eq!(q.take(4, 1).len(), 1);
        assert!(q.take(4, 1).is_empty());
        assert!(q.is_empty());
    }

    #[test]
    fn test_fresher_report_replaces_queued() {
        let mut q = DisseminationQueue::new(4);
        q.push(update(1, MemberStatus::Alive, 1));
        q.take(1, 8);

        q.push(update(1, MemberStatus::Suspect, 1));
        assert_eq!(q.len(), 1);
        let out = q.take(1, 8);
        assert_eq!(out[0].status, MemberStatus::Suspect);

        // A stale report never displaces the queued one
        q.push(update(1, MemberStatus::Alive, 0));
        let out = q.take(1, 8);
        assert_eq!(out[0].status, MemberStatus::Suspect);
    }

    #[test]
    fn test_observe_event_maps_refutation_to_local_alive() {
        let mut q = DisseminationQueue::new(4);
        let local = addr(9);
        q.observe_event(&MembershipEvent::LocalRefuted { incarnation: 3 }, local);
        let out = q.take(1, 4);
        assert_eq!(
            out,
            vec![GossipUpdate {
                status: MemberStatus::Alive,
                member: local,
                incarnation: 3,
            }]
        );

        q.observe_event(&MembershipEvent::MemberEvicted { member: local }, local);
        assert!(q.is_empty());
    }

    #[test]
    fn test_take_respects_limit() {
        let mut q = DisseminationQueue::new(4);
        for port in 1..6 {
            q.push(update(port, MemberStatus::Alive, 0));
        }
        assert_eq!(q.take(3, 8).len(), 3);
        assert_eq!(q.len(), 5);
    }
}
