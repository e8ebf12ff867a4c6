//! Integration tests for health checking, failover recovery and unicast
//! peer selection at the broker level.

use std::sync::Arc;
use std::time::Duration;

use meshweave::broker::Broker;
use meshweave::config::Config;
use meshweave::identity::{Keypair, PeerId};
use meshweave::message::{Message, Priority};
use meshweave::metrics::NullMetrics;
use meshweave::peer::Peer;
use meshweave::transport::{EmulatedNetwork, EmulatedTransport, LinkProfile};

const BOOTSTRAP_KEY: [u8; 32] = [17u8; 32];

fn quick_broker(id: &str) -> Arc<Broker> {
    let config = Config {
        retry_interval: Duration::from_millis(50),
        retry_max: 5,
        session_bootstrap_key: Some(BOOTSTRAP_KEY),
        ..Config::default()
    };
    Broker::new(
        PeerId::new(id),
        Keypair::generate(),
        BOOTSTRAP_KEY,
        &config,
        Arc::new(NullMetrics),
    )
}

fn hub_peer(hub: &EmulatedNetwork, id: &str) -> Arc<Peer> {
    Arc::new(Peer::new(
        PeerId::new(id),
        format!("emulated://{id}"),
        Arc::new(EmulatedTransport::new(
            hub.clone(),
            PeerId::new(id),
            LinkProfile::generic(),
        )),
    ))
}

/// A peer goes dark, fails its probe, cycles through the failover retries
/// and comes back healthy once the link recovers; the failure record is
/// removed on recovery.
#[tokio::test]
async fn peer_recovers_through_failover() {
    let hub = EmulatedNetwork::new();
    let _inbox = hub.attach(PeerId::new("p"));

    let broker = quick_broker("me");
    let peer = hub_peer(&hub, "p");
    broker.add_peer(peer.clone());

    // One failed probe marks the peer unhealthy and opens a failure record.
    hub.set_link_down(&PeerId::new("p"), true);
    broker.run_health_checks().await;
    assert!(!peer.is_healthy());
    assert!(broker.failover().is_failed(&PeerId::new("p")).await);

    // Let a couple of reconnect attempts fail, then restore the link.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let record = broker
        .failover()
        .failed_peers()
        .await
        .into_iter()
        .find(|r| r.id == PeerId::new("p"))
        .expect("record still open");
    assert!(record.retry_count <= 5 + 1, "retry budget bounded");
    assert!(!record.permanently_failed);

    hub.set_link_down(&PeerId::new("p"), false);

    // The next scheduled retry reconnects and clears the record.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if peer.is_healthy() && !broker.failover().is_failed(&PeerId::new("p")).await {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "peer never recovered through failover"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    broker.shutdown().await;
}

/// Removing a peer cancels its scheduled retries for good.
#[tokio::test]
async fn removed_peer_stops_retrying() {
    let hub = EmulatedNetwork::new();
    let _inbox = hub.attach(PeerId::new("p"));

    let broker = quick_broker("me");
    let peer = hub_peer(&hub, "p");
    broker.add_peer(peer.clone());

    hub.set_link_down(&PeerId::new("p"), true);
    broker.run_health_checks().await;
    assert!(broker.failover().is_failed(&PeerId::new("p")).await);

    broker.remove_peer(&PeerId::new("p")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!broker.failover().is_failed(&PeerId::new("p")).await);
    assert!(broker.failover().failed_peers().await.is_empty());
    broker.shutdown().await;
}

/// Load-balancer target hints at the broker surface: a healthy concrete
/// target wins, unknown and broadcast hints fall back to the strategy, and
/// an all-unhealthy roster yields nothing.
#[tokio::test]
async fn unicast_selection_honors_target_hints() {
    let hub = EmulatedNetwork::new();
    for id in ["a", "b", "c"] {
        let _ = hub.attach(PeerId::new(id));
    }

    let broker = quick_broker("me");
    let peers: Vec<Arc<Peer>> = ["a", "b", "c"]
        .iter()
        .map(|id| {
            let peer = hub_peer(&hub, id);
            broker.add_peer(peer.clone());
            peer
        })
        .collect();

    let chosen = broker
        .balancer()
        .select(&PeerId::new("b"))
        .expect("b is healthy");
    assert_eq!(chosen.id(), &PeerId::new("b"));

    assert!(broker.balancer().select(&PeerId::new("missing")).is_some());
    assert!(broker.balancer().select(&PeerId::broadcast()).is_some());

    for peer in &peers {
        peer.set_healthy(false);
    }
    assert!(broker.balancer().select(&PeerId::new("b")).is_none());
    assert!(broker.balancer().select(&PeerId::broadcast()).is_none());

    // With no healthy peer, a unicast send surfaces the no-peer error.
    let msg = Message::chat(
        PeerId::new("me"),
        PeerId::new("b"),
        b"nobody home".to_vec(),
        Priority::Normal,
    );
    assert!(broker.send(msg).await.is_err());
    broker.shutdown().await;
}
