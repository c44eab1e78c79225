// Membership Agent
//
// Wires the keyring, membership table, transport, and failure detector
// into one running agent. The protocol runs as a single task owning the
// detector state: every tick, every inbound datagram, and every ack timer
// is handled on that task, so all membership mutations are serialized and
// only one probe is ever outstanding.

use crate::config::AgentConfig;
use crate::detector::FailureDetector;
use crate::error::{GossipError, Result};
use crate::keyring::Keyring;
use crate::membership::{
    DisseminationQueue, GossipUpdate, Incarnation, MemberId, MemberStatus, MembershipEvent,
    MembershipTable,
};
use crate::transport::udp::MAX_DATAGRAM;
use crate::transport::{GossipMessage, TransportStats, TransportStatsSnapshot, UdpTransport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, sleep_until, Instant};

/// SWIM membership agent.
///
/// Construction validates the configuration and binds the transport;
/// `start` launches the protocol task. Membership changes stream out of
/// the receiver returned by `new`; delivery is at-least-once and consumers
/// must be idempotent.
pub struct SwimAgent {
    config: AgentConfig,
    local: MemberId,
    table: Arc<RwLock<MembershipTable>>,
    keyring: Arc<RwLock<Keyring>>,
    transport: Arc<UdpTransport>,
    dissemination: Arc<RwLock<DisseminationQueue>>,
    event_tx: mpsc::Sender<MembershipEvent>,
    stats: Arc<TransportStats>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl SwimAgent {
    /// Create an agent and the receiving end of its membership event
    /// stream. Fails only on invalid configuration or an unbindable
    /// socket.
    pub async fn new(config: AgentConfig) -> Result<(Self, mpsc::Receiver<MembershipEvent>)> {
        config.validate()?;

        let keyring = Arc::new(RwLock::new(Keyring::new(
            config.keys.clone(),
            config.aad.clone(),
        )?));
        let transport = Arc::new(UdpTransport::bind(config.bind_addr, keyring.clone()).await?);
        let local = transport.local_addr()?;
        let stats = transport.stats();

        let table = Arc::new(RwLock::new(MembershipTable::new(
            local,
            config.protocol_period,
            config.suspicion_mult,
        )));
        let dissemination = Arc::new(RwLock::new(DisseminationQueue::new(
            config.gossip_retransmit_mult,
        )));
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);

        Ok((
            Self {
                config,
                local,
                table,
                keyring,
                transport,
                dissemination,
                event_tx,
                stats,
                shutdown_tx: None,
            },
            event_rx,
        ))
    }

    /// Start the protocol task
    pub fn start(&mut self) -> Result<()> {
        if self.shutdown_tx.is_some() {
            return Err(GossipError::Configuration(
                "agent already started".to_string(),
            ));
        }
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let task = ProtocolTask {
            local: self.local,
            protocol_period: self.config.protocol_period,
            ack_timeout: self.config.ack_timeout,
            max_piggyback: self.config.max_piggyback,
            table: self.table.clone(),
            transport: self.transport.clone(),
            dissemination: self.dissemination.clone(),
            event_tx: self.event_tx.clone(),
            stats: self.stats.clone(),
            detector: FailureDetector::new(
                self.config.ack_timeout,
                self.config.num_proxies,
                self.config.initial_sequence,
            ),
            relays: HashMap::new(),
        };
        tokio::spawn(task.run(shutdown_rx));
        Ok(())
    }

    /// Stop the protocol task cooperatively
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }
    }

    /// The configured local identity
    pub fn local_member(&self) -> MemberId {
        self.local
    }

    /// The local member's current incarnation
    pub async fn local_incarnation(&self) -> Incarnation {
        self.table.read().await.local_incarnation()
    }

    /// Snapshot of all known non-local members
    pub async fn members(&self) -> Vec<(MemberId, MemberStatus, Incarnation)> {
        self.table.read().await.members()
    }

    /// Inject an external alive report, e.g. from a bootstrap oracle.
    /// New members enter the probe rotation at the next round refill.
    pub async fn alive(&self, peer: MemberId, incarnation: Incarnation) {
        let events = self.table.write().await.alive(peer, incarnation);
        publish_events(events, &self.dissemination, &self.event_tx, self.local).await;
    }

    /// Seed the agent with initial peers
    pub async fn join(&self, seeds: &[MemberId]) {
        for seed in seeds {
            if *seed != self.local {
                self.alive(*seed, 0).await;
            }
        }
    }

    /// Install a new encryption key. The new key becomes active for
    /// outbound datagrams immediately; previous keys remain valid for
    /// decryption until the ring is rebuilt without them.
    pub async fn install_key(&self, key: Vec<u8>) -> Result<()> {
        let mut ring = self.keyring.write().await;
        *ring = ring.add(key)?;
        tracing::debug!(keys = ring.len(), "Installed new encryption key");
        Ok(())
    }

    /// Current transport counters
    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }
}

/// What woke the protocol task
enum Wake {
    Shutdown,
    Tick,
    AckTimeout,
    Datagram(GossipMessage, SocketAddr),
    Dropped,
}

/// A PING forwarded on behalf of another node, waiting for the target's
/// ack
struct RelayedProbe {
    origin: MemberId,
    deadline: Instant,
}

/// The single task that owns the detector and serializes the protocol
struct ProtocolTask {
    local: MemberId,
    protocol_period: std::time::Duration,
    ack_timeout: std::time::Duration,
    max_piggyback: usize,
    table: Arc<RwLock<MembershipTable>>,
    transport: Arc<UdpTransport>,
    dissemination: Arc<RwLock<DisseminationQueue>>,
    event_tx: mpsc::Sender<MembershipEvent>,
    stats: Arc<TransportStats>,
    detector: FailureDetector,
    relays: HashMap<(u32, MemberId), RelayedProbe>,
}

impl ProtocolTask {
    async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = interval(self.protocol_period);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tracing::debug!(local = %self.local, "Membership protocol task started");

        loop {
            let ack_deadline = self.detector.ack_deadline();
            let wake = tokio::select! {
                _ = shutdown_rx.recv() => Wake::Shutdown,
                _ = ticker.tick() => Wake::Tick,
                _ = sleep_until_opt(ack_deadline) => Wake::AckTimeout,
                received = self.transport.recv(&mut buf) => match received {
                    Some((message, src)) => Wake::Datagram(message, src),
                    None => Wake::Dropped,
                },
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Tick => self.on_tick().await,
                Wake::AckTimeout => self.on_ack_timeout().await,
                Wake::Datagram(message, src) => self.on_message(message, src).await,
                Wake::Dropped => {}
            }
        }

        tracing::debug!(local = %self.local, "Membership protocol task stopped");
    }

    /// One protocol period: settle relayed probes, sweep the table,
    /// resolve the previous probe, and launch the next one.
    async fn on_tick(&mut self) {
        let now = Instant::now();
        self.flush_expired_relays(now).await;

        let (events, plan) = {
            let mut table = self.table.write().await;
            let mut events = table.sweep();
            if let Some((peer, incarnation)) = self.detector.resolve_expired_probe() {
                events.extend(table.suspect(peer, incarnation));
            }
            let plan = self.detector.plan_probe(&table, now);
            (events, plan)
        };
        publish_events(events, &self.dissemination, &self.event_tx, self.local).await;

        if let Some(plan) = plan {
            let updates = self.take_updates().await;
            let ping = GossipMessage::Ping {
                seq: plan.seq,
                from: self.local,
                target_inc: plan.target_inc,
                updates,
            };
            self.transport.send(&ping, plan.target).await;
        }
    }

    /// The direct probe went unanswered; fan out ping-reqs to the proxies
    async fn on_ack_timeout(&mut self) {
        let Some((seq, target, proxies)) = self.detector.begin_indirect() else {
            return;
        };
        if proxies.is_empty() {
            tracing::trace!(target = %target, seq, "No proxies available for indirect probe");
            return;
        }
        let updates = self.take_updates().await;
        let ping_req = GossipMessage::PingReq {
            seq,
            from: self.local,
            target,
            updates,
        };
        for proxy in proxies {
            self.transport.send(&ping_req, proxy).await;
        }
    }

    async fn on_message(&mut self, message: GossipMessage, src: SocketAddr) {
        match message {
            GossipMessage::Ping {
                seq,
                from,
                target_inc,
                updates,
            } => {
                self.apply_updates(updates).await;

                let (events, local_inc) = {
                    let mut table = self.table.write().await;
                    let events = table.alive(from, 0);
                    (events, table.local_incarnation())
                };
                publish_events(events, &self.dissemination, &self.event_tx, self.local).await;

                if target_inc < local_inc {
                    // The prober holds a stale view of us; gossip a fresh
                    // alive so it catches up
                    self.dissemination.write().await.push(GossipUpdate {
                        status: MemberStatus::Alive,
                        member: self.local,
                        incarnation: local_inc,
                    });
                }

                let updates = self.take_updates().await;
                let ack = GossipMessage::Ack {
                    seq,
                    from: self.local,
                    inc: local_inc,
                    updates,
                };
                self.transport.send(&ack, from).await;
            }

            GossipMessage::Ack {
                seq,
                from,
                inc,
                updates,
            } => {
                self.apply_updates(updates).await;

                // An ack can satisfy our own probe and a relayed one at
                // once when sequence numbers from different nodes collide
                let matched = self.detector.record_ack(from, seq);
                let relay = self.relays.remove(&(seq, from));

                if matched || relay.is_some() {
                    let events = self.table.write().await.alive(from, inc);
                    publish_events(events, &self.dissemination, &self.event_tx, self.local).await;
                }
                if matched {
                    tracing::trace!(peer = %from, seq, "Probe succeeded");
                }
                if let Some(relay) = relay {
                    let updates = self.take_updates().await;
                    let forwarded = GossipMessage::Ack {
                        seq,
                        from,
                        inc,
                        updates,
                    };
                    self.transport.send(&forwarded, relay.origin).await;
                } else if !matched {
                    self.stats.stale_acks.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(peer = %from, seq, "Discarding stale ack");
                }
            }

            GossipMessage::PingReq {
                seq,
                from,
                target,
                updates,
            } => {
                self.apply_updates(updates).await;

                if target == self.local {
                    // Degenerate routing; answer directly
                    let inc = self.table.read().await.local_incarnation();
                    let updates = self.take_updates().await;
                    let ack = GossipMessage::Ack {
                        seq,
                        from: self.local,
                        inc,
                        updates,
                    };
                    self.transport.send(&ack, from).await;
                    return;
                }

                self.relays.insert(
                    (seq, target),
                    RelayedProbe {
                        origin: from,
                        deadline: Instant::now() + self.ack_timeout,
                    },
                );
                let target_inc = self
                    .table
                    .read()
                    .await
                    .incarnation_of(&target)
                    .unwrap_or(0);
                let updates = self.take_updates().await;
                let ping = GossipMessage::Ping {
                    seq,
                    from: self.local,
                    target_inc,
                    updates,
                };
                self.transport.send(&ping, target).await;
            }

            GossipMessage::Nack { seq } => {
                // Informational; tick-boundary resolution already covers
                // the silent case
                tracing::trace!(seq, from = %src, "Indirect probe nacked");
            }
        }
    }

    /// Apply piggybacked reports to the table
    async fn apply_updates(&self, updates: Vec<GossipUpdate>) {
        if updates.is_empty() {
            return;
        }
        let events = {
            let mut table = self.table.write().await;
            let mut events = Vec::new();
            for update in updates {
                let produced = match update.status {
                    MemberStatus::Alive => table.alive(update.member, update.incarnation),
                    MemberStatus::Suspect => table.suspect(update.member, update.incarnation),
                    MemberStatus::Faulty => table.faulty(update.member, update.incarnation),
                };
                events.extend(produced);
            }
            events
        };
        publish_events(events, &self.dissemination, &self.event_tx, self.local).await;
    }

    /// Relayed probes that never heard back get a NACK to their origin
    async fn flush_expired_relays(&mut self, now: Instant) {
        let expired: Vec<((u32, MemberId), MemberId)> = self
            .relays
            .iter()
            .filter(|(_, relay)| now >= relay.deadline)
            .map(|(key, relay)| (*key, relay.origin))
            .collect();
        for ((seq, target), origin) in expired {
            self.relays.remove(&(seq, target));
            tracing::trace!(seq, target = %target, origin = %origin, "Relayed probe timed out");
            self.transport
                .send(&GossipMessage::Nack { seq }, origin)
                .await;
        }
    }

    /// Pull the next batch of piggyback updates for one datagram
    async fn take_updates(&self) -> Vec<GossipUpdate> {
        let cluster_size = self.table.read().await.cluster_size();
        self.dissemination
            .write()
            .await
            .take(self.max_piggyback, cluster_size)
    }
}

/// Forward events to the dissemination queue and the event sink
async fn publish_events(
    events: Vec<MembershipEvent>,
    dissemination: &RwLock<DisseminationQueue>,
    event_tx: &mpsc::Sender<MembershipEvent>,
    local: MemberId,
) {
    if events.is_empty() {
        return;
    }
    {
        let mut queue = dissemination.write().await;
        for event in &events {
            queue.observe_event(event, local);
        }
    }
    for event in events {
        let _ = event_tx.send(event).await;
    }
}

/// Sleep until the deadline, or forever when no timer is armed
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
