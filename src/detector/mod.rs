// Failure Detector
//
// The protocol-period state machine. Each period the detector resolves the
// previous probe, pops the next target off a shuffled round queue, and
// plans a direct probe with a proxy set for the indirect fallback. Silence
// through the ack timeout escalates to indirect probes; silence through
// the whole period marks the target suspect at the next tick, never inside
// a timer callback, so at most one status mutation per member per period
// originates here.
//
// The round queue enforces the SWIM load-spreading property: every member
// is probed exactly once per round. Members joining mid-round are picked
// up at the next refill.
//
// The detector never touches the network itself. Its methods return probe
// plans and verdicts; the protocol task turns those into datagrams. That
// split keeps the state machine testable without sockets.

use crate::membership::{Incarnation, MemberId, MembershipTable};
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Probe phase within one protocol period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbePhase {
    /// Waiting for a direct ack
    Direct,

    /// Direct probe timed out; ping-reqs are in flight
    Indirect,
}

/// The probe outstanding in the current period
#[derive(Debug, Clone)]
struct Probe {
    target: MemberId,
    incarnation: Incarnation,
    seq: u32,
    deadline: Instant,
    phase: ProbePhase,
    proxies: Vec<MemberId>,
}

/// Everything the protocol task needs to emit one direct probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePlan {
    pub target: MemberId,
    pub target_inc: Incarnation,
    pub seq: u32,
    pub proxies: Vec<MemberId>,
}

/// Protocol-period failure detector state machine
#[derive(Debug)]
pub struct FailureDetector {
    ack_timeout: Duration,
    num_proxies: usize,
    sequence: u32,
    current: Option<Probe>,
    targets: VecDeque<(MemberId, Incarnation)>,

    /// Full shuffled order of the current round; proxies are drawn from
    /// here so even the last target of a round gets a proxy set
    round: Vec<MemberId>,
}

impl FailureDetector {
    pub fn new(ack_timeout: Duration, num_proxies: usize, initial_sequence: u32) -> Self {
        Self {
            ack_timeout,
            num_proxies,
            sequence: initial_sequence,
            current: None,
            targets: VecDeque::new(),
            round: Vec::new(),
        }
    }

    /// The member probed in the current period, if any
    pub fn current_target(&self) -> Option<MemberId> {
        self.current.as_ref().map(|p| p.target)
    }

    /// Deadline of the direct-probe ack timer, while one is armed
    pub fn ack_deadline(&self) -> Option<Instant> {
        self.current
            .as_ref()
            .filter(|p| p.phase == ProbePhase::Direct)
            .map(|p| p.deadline)
    }

    /// Tick step 1: if the previous period's probe is still outstanding,
    /// no ack arrived in time. Clears it and hands back the target to mark
    /// suspect at the incarnation it was probed at.
    pub fn resolve_expired_probe(&mut self) -> Option<(MemberId, Incarnation)> {
        let probe = self.current.take()?;
        tracing::debug!(
            target = %probe.target,
            seq = probe.seq,
            "Probe went unanswered for a full period"
        );
        Some((probe.target, probe.incarnation))
    }

    /// Tick steps 2-4: refill and shuffle the round queue when empty, pop
    /// the next target, pick proxies from the rest of the current round.
    /// Returns `None` when there is nobody to probe.
    pub fn plan_probe(&mut self, table: &MembershipTable, now: Instant) -> Option<ProbePlan> {
        let (target, incarnation) = loop {
            if self.targets.is_empty() {
                let mut round = table.probe_candidates();
                round.shuffle(&mut rand::rng());
                self.round = round.iter().map(|(member, _)| *member).collect();
                self.targets = round.into();
                if self.targets.is_empty() {
                    // Solo node: the tick is a no-op
                    return None;
                }
            }
            match self.targets.pop_front() {
                Some((target, incarnation)) if table.is_probeable(&target) => {
                    break (target, incarnation)
                }
                // Went faulty or was evicted mid-round; skip it
                Some(_) => continue,
                None => return None,
            }
        };

        self.sequence = self.sequence.wrapping_add(1);
        let proxies: Vec<MemberId> = self
            .round
            .iter()
            .copied()
            .filter(|member| *member != target && table.is_probeable(member))
            .take(self.num_proxies)
            .collect();

        self.current = Some(Probe {
            target,
            incarnation,
            seq: self.sequence,
            deadline: now + self.ack_timeout,
            phase: ProbePhase::Direct,
            proxies: proxies.clone(),
        });

        tracing::trace!(target = %target, seq = self.sequence, proxies = proxies.len(), "Planned probe");
        Some(ProbePlan {
            target,
            target_inc: incarnation,
            seq: self.sequence,
            proxies,
        })
    }

    /// Ack delivery. Returns true when the ack matches the outstanding
    /// probe (which it clears); false means the ack is stale and should
    /// only be counted.
    pub fn record_ack(&mut self, from: MemberId, seq: u32) -> bool {
        match &self.current {
            Some(probe) if probe.seq == seq && probe.target == from => {
                self.current = None;
                true
            }
            _ => false,
        }
    }

    /// Ack-timeout expiry. Transitions the probe to its indirect phase and
    /// returns what the ping-req fan-out needs. Idempotent: a late timer
    /// firing after an ack or a phase change returns `None`.
    pub fn begin_indirect(&mut self) -> Option<(u32, MemberId, Vec<MemberId>)> {
        let probe = self.current.as_mut()?;
        if probe.phase != ProbePhase::Direct {
            return None;
        }
        probe.phase = ProbePhase::Indirect;
        tracing::debug!(
            target = %probe.target,
            seq = probe.seq,
            proxies = probe.proxies.len(),
            "Direct probe timed out, falling back to indirect probes"
        );
        Some((probe.seq, probe.target, probe.proxies.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr(port: u16) -> MemberId {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn table_with(ports: &[u16]) -> MembershipTable {
        let mut table = MembershipTable::new(addr(9000), Duration::from_millis(100), 3);
        for &port in ports {
            table.alive(addr(port), 0);
        }
        table
    }

    fn detector() -> FailureDetector {
        FailureDetector::new(Duration::from_millis(50), 3, 0)
    }

    #[test]
    fn test_solo_node_is_noop() {
        let table = table_with(&[]);
        let mut d = detector();
        assert!(d.plan_probe(&table, Instant::now()).is_none());
        assert!(d.current_target().is_none());
    }

    #[test]
    fn test_round_covers_every_member_once() {
        let ports: Vec<u16> = (9001..9011).collect();
        let table = table_with(&ports);
        let mut d = detector();

        let mut probed = Vec::new();
        for _ in 0..ports.len() {
            let plan = d.plan_probe(&table, Instant::now()).unwrap();
            probed.push(plan.target);
            assert!(d.record_ack(plan.target, plan.seq));
        }

        let unique: HashSet<_> = probed.iter().collect();
        assert_eq!(unique.len(), ports.len());
    }

    #[test]
    fn test_sequence_increments_per_probe() {
        let table = table_with(&[9001, 9002]);
        let mut d = detector();

        let first = d.plan_probe(&table, Instant::now()).unwrap();
        assert!(d.record_ack(first.target, first.seq));
        let second = d.plan_probe(&table, Instant::now()).unwrap();
        assert_eq!(second.seq, first.seq + 1);
    }

    #[test]
    fn test_proxies_exclude_target_and_respect_fanout() {
        let ports: Vec<u16> = (9001..9011).collect();
        let table = table_with(&ports);
        let mut d = detector();

        let plan = d.plan_probe(&table, Instant::now()).unwrap();
        assert!(plan.proxies.len() <= 3);
        assert!(!plan.proxies.contains(&plan.target));

        // Two members total: exactly one proxy is available, including for
        // the last target of the round
        let small = table_with(&[9001, 9002]);
        let mut d = detector();
        let first = d.plan_probe(&small, Instant::now()).unwrap();
        assert_eq!(first.proxies.len(), 1);
        assert!(d.record_ack(first.target, first.seq));
        let second = d.plan_probe(&small, Instant::now()).unwrap();
        assert_eq!(second.proxies.len(), 1);
        assert_ne!(second.target, first.target);
    }

    #[test]
    fn test_stale_ack_is_rejected() {
        let table = table_with(&[9001]);
        let mut d = detector();
        let plan = d.plan_probe(&table, Instant::now()).unwrap();

        assert!(!d.record_ack(plan.target, plan.seq + 1));
        assert!(!d.record_ack(addr(9999), plan.seq));
        assert!(d.current_target().is_some());

        assert!(d.record_ack(plan.target, plan.seq));
        assert!(d.current_target().is_none());

        // A second delivery of the same ack is stale
        assert!(!d.record_ack(plan.target, plan.seq));
    }

    #[test]
    fn test_unanswered_probe_resolves_to_suspect() {
        let table = table_with(&[9001]);
        let mut d = detector();
        let plan = d.plan_probe(&table, Instant::now()).unwrap();

        let (target, incarnation) = d.resolve_expired_probe().unwrap();
        assert_eq!(target, plan.target);
        assert_eq!(incarnation, 0);
        assert!(d.resolve_expired_probe().is_none());
    }

    #[test]
    fn test_ack_clears_escalation() {
        let table = table_with(&[9001]);
        let mut d = detector();
        let plan = d.plan_probe(&table, Instant::now()).unwrap();
        assert!(d.record_ack(plan.target, plan.seq));
        assert!(d.resolve_expired_probe().is_none());
        assert!(d.ack_deadline().is_none());
    }

    #[test]
    fn test_begin_indirect_fires_once() {
        let table = table_with(&[9001, 9002, 9003]);
        let mut d = detector();
        let plan = d.plan_probe(&table, Instant::now()).unwrap();
        assert!(d.ack_deadline().is_some());

        let (seq, target, proxies) = d.begin_indirect().unwrap();
        assert_eq!(seq, plan.seq);
        assert_eq!(target, plan.target);
        assert_eq!(proxies, plan.proxies);

        // The timer is disarmed and a late firing is a no-op
        assert!(d.ack_deadline().is_none());
        assert!(d.begin_indirect().is_none());

        // An indirect ack still resolves the probe
        assert!(d.record_ack(plan.target, plan.seq));
    }

    #[test]
    fn test_faulty_target_skipped_mid_round() {
        let mut table = table_with(&[9001, 9002]);
        let mut d = detector();

        let first = d.plan_probe(&table, Instant::now()).unwrap();
        assert!(d.record_ack(first.target, first.seq));

        // The remaining queued member fails before its probe comes up
        let remaining = if first.target == addr(9001) {
            addr(9002)
        } else {
            addr(9001)
        };
        table.faulty(remaining, 1);

        // The detector skips it and starts a fresh round with the survivor
        let next = d.plan_probe(&table, Instant::now()).unwrap();
        assert_eq!(next.target, first.target);
    }

    #[test]
    fn test_initial_sequence_restored() {
        let table = table_with(&[9001]);
        let mut d = FailureDetector::new(Duration::from_millis(50), 3, 41);
        let plan = d.plan_probe(&table, Instant::now()).unwrap();
        assert_eq!(plan.seq, 42);
    }
}
