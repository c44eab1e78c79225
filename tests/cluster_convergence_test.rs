// Cluster Convergence Integration Test
//
// Spins up real agents on loopback UDP sockets and validates the
// protocol end to end: mutual discovery through probing and piggybacked
// gossip, failure detection of a stopped node, and the key-rotation
// window.

use rusty_gossip::keyring::KEY_LEN;
use rusty_gossip::transport::udp::MAX_DATAGRAM;
use rusty_gossip::transport::{GossipMessage, UdpTransport};
use rusty_gossip::{AgentConfig, Keyring, MemberId, MembershipEvent, SwimAgent};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

/// Route agent logs through the test harness; safe to call from every test
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config(key_fill: u8) -> AgentConfig {
    AgentConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        protocol_period: Duration::from_millis(150),
        ack_timeout: Duration::from_millis(60),
        keys: vec![vec![key_fill; KEY_LEN]],
        aad: b"integration-cluster".to_vec(),
        ..Default::default()
    }
}

/// Start an agent and drain its event stream so the channel never fills
async fn spawn_agent(config: AgentConfig) -> SwimAgent {
    let (mut agent, events) = SwimAgent::new(config).await.unwrap();
    agent.start().unwrap();
    drain(events);
    agent
}

fn drain(mut events: mpsc::Receiver<MembershipEvent>) {
    tokio::spawn(async move { while events.recv().await.is_some() {} });
}

/// Poll `check` until it passes or the deadline expires
async fn wait_for<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let until = Instant::now() + deadline;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= until {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn sees_alive(agent: &SwimAgent, peer: MemberId) -> bool {
    agent
        .members()
        .await
        .iter()
        .any(|(member, status, _)| *member == peer && status.is_alive())
}

async fn knows(agent: &SwimAgent, peer: MemberId) -> bool {
    agent
        .members()
        .await
        .iter()
        .any(|(member, _, _)| *member == peer)
}

#[tokio::test]
async fn test_three_node_convergence() {
    init_tracing();
    let a = spawn_agent(test_config(1)).await;
    let b = spawn_agent(test_config(1)).await;
    let c = spawn_agent(test_config(1)).await;

    // Only the seed edges are configured; gossip has to fill in the rest
    b.join(&[a.local_member()]).await;
    c.join(&[a.local_member()]).await;

    let agents = [&a, &b, &c];
    let converged = wait_for(Duration::from_secs(20), move || async move {
        for agent in agents {
            for peer in agents {
                let peer = peer.local_member();
                if peer != agent.local_member() && !sees_alive(agent, peer).await {
                    return false;
                }
            }
        }
        true
    })
    .await;

    assert!(converged, "cluster failed to converge to all-alive");
    assert_eq!(a.members().await.len(), 2);
    assert_eq!(b.members().await.len(), 2);
    assert_eq!(c.members().await.len(), 2);
}

#[tokio::test]
async fn test_stopped_node_is_detected_and_evicted() {
    init_tracing();
    let a = spawn_agent(test_config(2)).await;
    let b = spawn_agent(test_config(2)).await;
    let mut c = spawn_agent(test_config(2)).await;

    b.join(&[a.local_member()]).await;
    c.join(&[a.local_member()]).await;

    let c_id = c.local_member();
    let (a_ref, b_ref) = (&a, &b);
    let converged = wait_for(Duration::from_secs(20), move || async move {
        sees_alive(a_ref, c_id).await && sees_alive(b_ref, c_id).await
    })
    .await;
    assert!(converged, "cluster never converged before the failure");

    // C goes silent
    c.stop().await;
    drop(c);

    // A first suspects C, then confirms it faulty and evicts it
    let evicted = wait_for(Duration::from_secs(30), move || async move {
        !knows(a_ref, c_id).await
    })
    .await;
    assert!(evicted, "stopped node was never evicted");
}

#[tokio::test]
async fn test_indirect_probe_keeps_half_reachable_member_alive() {
    init_tracing();
    let a = spawn_agent(test_config(7)).await;
    let c = spawn_agent(test_config(7)).await;
    let a_id = a.local_member();
    let c_id = c.local_member();

    // B answers probes from everyone except A, simulating a one-way
    // network fault on the A-B path
    let ring = Keyring::new(vec![vec![7u8; KEY_LEN]], b"integration-cluster".to_vec()).unwrap();
    let b_transport = Arc::new(
        UdpTransport::bind("127.0.0.1:0".parse().unwrap(), Arc::new(RwLock::new(ring)))
            .await
            .unwrap(),
    );
    let b_id = b_transport.local_addr().unwrap();
    let responder = b_transport.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if let Some((message, src)) = responder.recv(&mut buf).await {
                if src == a_id {
                    continue;
                }
                if let GossipMessage::Ping { seq, from, .. } = message {
                    let ack = GossipMessage::Ack {
                        seq,
                        from: b_id,
                        inc: 0,
                        updates: Vec::new(),
                    };
                    responder.send(&ack, from).await;
                }
            }
        }
    });

    a.alive(b_id, 0).await;
    a.alive(c_id, 0).await;
    c.alive(b_id, 0).await;
    c.alive(a_id, 0).await;

    // Every direct probe of B from A times out, so B's aliveness in A's
    // view can only come from indirect acks relayed through C
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(
        sees_alive(&a, b_id).await,
        "indirect probes failed to keep the half-reachable member alive"
    );
}

#[tokio::test]
async fn test_wrong_key_node_stays_isolated() {
    init_tracing();
    let a = spawn_agent(test_config(3)).await;
    let outsider = spawn_agent(test_config(4)).await;

    outsider.join(&[a.local_member()]).await;

    // Give the outsider several protocol periods to try
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Its probes never verify on A, so A never learns it exists
    assert!(a.members().await.is_empty());
    assert!(a.stats().failed_verifications > 0);
    assert!(!sees_alive(&outsider, a.local_member()).await);
}

#[tokio::test]
async fn test_key_rotation_heals_after_propagation() {
    init_tracing();
    let a = spawn_agent(test_config(5)).await;
    let b = spawn_agent(test_config(5)).await;

    b.join(&[a.local_member()]).await;
    let (a_ref, b_ref) = (&a, &b);
    let (a_id, b_id) = (a.local_member(), b.local_member());
    let converged = wait_for(Duration::from_secs(20), move || async move {
        sees_alive(a_ref, b_id).await && sees_alive(b_ref, a_id).await
    })
    .await;
    assert!(converged, "two-node cluster never converged");

    // Rotate on A only: A now encrypts under the new key, and B starts
    // dropping A's datagrams
    let new_key = vec![6u8; KEY_LEN];
    a.install_key(new_key.clone()).await.unwrap();

    let dropping = wait_for(Duration::from_secs(10), move || async move {
        b_ref.stats().failed_verifications > 0
    })
    .await;
    assert!(dropping, "old ring unexpectedly read the rotated traffic");

    // Complete the rotation and re-seed in case either side already
    // evicted the other during the window
    b.install_key(new_key).await.unwrap();
    a.join(&[b_id]).await;
    b.join(&[a_id]).await;

    let healed = wait_for(Duration::from_secs(20), move || async move {
        sees_alive(a_ref, b_id).await && sees_alive(b_ref, a_id).await
    })
    .await;
    assert!(healed, "cluster did not heal after full rotation");
}
