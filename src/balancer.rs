//! # Unicast Load Balancer
//!
//! Selects one healthy peer for a unicast send. A concrete target hint that
//! names a healthy peer short-circuits selection; otherwise the configured
//! strategy runs over the healthy subset:
//!
//! | Strategy | Behavior |
//! |----------|----------|
//! | `round_robin` | deterministic rotation; every call advances the cursor |
//! | `random` | uniform choice |
//! | `least_connections` | minimum connection count, ties by insertion order |
//! | `weighted_random` | cumulative weights; all-zero falls back to uniform |
//!
//! `select` returns `None` iff no healthy peer exists. The strategy is
//! runtime-switchable. The balancer holds only weak peer references; the
//! broker's peer table is the sole owner and removal invalidates entries
//! here immediately.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use tracing::debug;

use crate::identity::PeerId;
use crate::peer::Peer;

/// Load-balancing strategies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    WeightedRandom,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Random => "random",
            Strategy::LeastConnections => "least_connections",
            Strategy::WeightedRandom => "weighted_random",
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "least_connections" => Ok(Strategy::LeastConnections),
            "weighted_random" => Ok(Strategy::WeightedRandom),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

struct Inner {
    /// Insertion-ordered roster. Weak refs: a removed peer drops out on the
    /// next selection pass.
    peers: Vec<(PeerId, Weak<Peer>)>,
    strategy: Strategy,
}

/// Healthy-peer selector over the broker's roster.
pub struct LoadBalancer {
    inner: Mutex<Inner>,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                peers: Vec::new(),
                strategy,
            }),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Add a peer to the roster. Idempotent on peer id.
    pub fn add_peer(&self, peer: &Arc<Peer>) {
        let mut inner = self.inner.lock().expect("balancer lock poisoned");
        if inner.peers.iter().any(|(id, _)| id == peer.id()) {
            return;
        }
        inner.peers.push((peer.id().clone(), Arc::downgrade(peer)));
        debug!(peer = %peer.id(), "added peer to load balancer");
    }

    pub fn remove_peer(&self, id: &PeerId) {
        let mut inner = self.inner.lock().expect("balancer lock poisoned");
        inner.peers.retain(|(peer_id, _)| peer_id != id);
    }

    pub fn strategy(&self) -> Strategy {
        self.inner.lock().expect("balancer lock poisoned").strategy
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        let mut inner = self.inner.lock().expect("balancer lock poisoned");
        inner.strategy = strategy;
        debug!(strategy = strategy.as_str(), "changed load balancing strategy");
    }

    /// Select a peer for the given destination hint.
    ///
    /// A concrete healthy target wins outright; the broadcast token and
    /// unknown ids fall through to the strategy. Returns `None` iff no
    /// healthy peer exists.
    pub fn select(&self, target: &PeerId) -> Option<Arc<Peer>> {
        let (healthy, strategy) = {
            let inner = self.inner.lock().expect("balancer lock poisoned");

            if !target.is_broadcast() {
                if let Some(peer) = inner
                    .peers
                    .iter()
                    .find(|(id, _)| id == target)
                    .and_then(|(_, weak)| weak.upgrade())
                {
                    if peer.is_healthy() {
                        return Some(peer);
                    }
                }
            }

            let healthy: Vec<Arc<Peer>> = inner
                .peers
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .filter(|p| p.is_healthy())
                .collect();
            (healthy, inner.strategy)
        };

        if healthy.is_empty() {
            return None;
        }

        let chosen = match strategy {
            Strategy::RoundRobin => self.select_round_robin(&healthy),
            Strategy::Random => Self::select_random(&healthy),
            Strategy::LeastConnections => Self::select_least_connections(&healthy),
            Strategy::WeightedRandom => Self::select_weighted_random(&healthy),
        };
        Some(chosen.clone())
    }

    fn select_round_robin<'a>(&self, peers: &'a [Arc<Peer>]) -> &'a Arc<Peer> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % peers.len();
        &peers[index]
    }

    fn select_random(peers: &[Arc<Peer>]) -> &Arc<Peer> {
        &peers[OsRng.gen_range(0..peers.len())]
    }

    fn select_least_connections(peers: &[Arc<Peer>]) -> &Arc<Peer> {
        let mut min_peer = &peers[0];
        let mut min_connections = min_peer.connection_count();
        for peer in &peers[1..] {
            let connections = peer.connection_count();
            // Strict less-than keeps the earliest-inserted peer on ties.
            if connections < min_connections {
                min_peer = peer;
                min_connections = connections;
            }
        }
        min_peer
    }

    fn select_weighted_random(peers: &[Arc<Peer>]) -> &Arc<Peer> {
        let total: u64 = peers.iter().map(|p| p.weight() as u64).sum();
        if total == 0 {
            return Self::select_random(peers);
        }

        let mut remaining = OsRng.gen_range(0..total);
        for peer in peers {
            let weight = peer.weight() as u64;
            if remaining < weight {
                return peer;
            }
            remaining -= weight;
        }
        // Unreachable with a correct total; keep the last peer as backstop.
        &peers[peers.len() - 1]
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let inner = self.inner.lock().expect("balancer lock poisoned");
        let mut healthy = 0usize;
        let mut total = 0usize;
        let mut connections = 0u64;
        for (_, weak) in &inner.peers {
            if let Some(peer) = weak.upgrade() {
                total += 1;
                if peer.is_healthy() {
                    healthy += 1;
                }
                connections += peer.connection_count() as u64;
            }
        }
        LoadBalancerStats {
            total_peers: total,
            healthy_peers: healthy,
            total_connections: connections,
            strategy: inner.strategy.as_str(),
        }
    }
}

/// Snapshot of balancer state for the stats surface.
#[derive(Clone, Debug, Serialize)]
pub struct LoadBalancerStats {
    pub total_peers: usize,
    pub healthy_peers: usize,
    pub total_connections: u64,
    pub strategy: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::peer::{PeerTransport, TransportError};
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl PeerTransport for NullTransport {
        async fn send(&self, _m: &Message) -> Result<(), TransportError> {
            Ok(())
        }
        async fn health_check(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn reconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn peer(id: &str) -> Arc<Peer> {
        Arc::new(Peer::new(
            PeerId::new(id),
            format!("emulated://{id}"),
            Arc::new(NullTransport),
        ))
    }

    fn balancer_with(peers: &[Arc<Peer>], strategy: Strategy) -> LoadBalancer {
        let lb = LoadBalancer::new(strategy);
        for p in peers {
            lb.add_peer(p);
        }
        lb
    }

    #[test]
    fn concrete_healthy_target_wins() {
        let peers = [peer("a"), peer("b"), peer("c")];
        let lb = balancer_with(&peers, Strategy::RoundRobin);

        let chosen = lb.select(&PeerId::new("b")).expect("b is healthy");
        assert_eq!(chosen.id(), &PeerId::new("b"));
    }

    #[test]
    fn unknown_and_broadcast_hints_fall_back_to_strategy() {
        let peers = [peer("a"), peer("b"), peer("c")];
        let lb = balancer_with(&peers, Strategy::RoundRobin);

        assert!(lb.select(&PeerId::new("missing")).is_some());
        assert!(lb.select(&PeerId::broadcast()).is_some());
    }

    #[test]
    fn no_healthy_peer_yields_none() {
        let peers = [peer("a"), peer("b")];
        let lb = balancer_with(&peers, Strategy::Random);
        for p in &peers {
            p.set_healthy(false);
        }
        assert!(lb.select(&PeerId::new("a")).is_none());
        assert!(lb.select(&PeerId::broadcast()).is_none());
    }

    #[test]
    fn round_robin_rotates_deterministically() {
        let peers = [peer("a"), peer("b"), peer("c")];
        let lb = balancer_with(&peers, Strategy::RoundRobin);

        let picks: Vec<String> = (0..6)
            .map(|_| {
                lb.select(&PeerId::broadcast())
                    .expect("healthy peers exist")
                    .id()
                    .to_string()
            })
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn unhealthy_target_falls_back() {
        let peers = [peer("a"), peer("b")];
        let lb = balancer_with(&peers, Strategy::RoundRobin);
        peers[1].set_healthy(false);

        let chosen = lb.select(&PeerId::new("b")).expect("a is still healthy");
        assert_eq!(chosen.id(), &PeerId::new("a"));
    }

    #[test]
    fn least_connections_breaks_ties_by_insertion_order() {
        let peers = [peer("a"), peer("b"), peer("c")];
        let lb = balancer_with(&peers, Strategy::LeastConnections);

        let chosen = lb.select(&PeerId::broadcast()).expect("peers exist");
        assert_eq!(chosen.id(), &PeerId::new("a"));

        peers[0].incr_connections();
        peers[1].incr_connections();
        let chosen = lb.select(&PeerId::broadcast()).expect("peers exist");
        assert_eq!(chosen.id(), &PeerId::new("c"));
    }

    #[test]
    fn weighted_random_respects_zero_weights() {
        let peers = [peer("a"), peer("b")];
        peers[0].set_weight(0);
        peers[1].set_weight(0);
        let lb = balancer_with(&peers, Strategy::WeightedRandom);
        // All-zero weights fall back to uniform random; must still pick someone.
        assert!(lb.select(&PeerId::broadcast()).is_some());

        peers[0].set_weight(0);
        peers[1].set_weight(5);
        for _ in 0..20 {
            let chosen = lb.select(&PeerId::broadcast()).expect("peers exist");
            assert_eq!(chosen.id(), &PeerId::new("b"), "zero-weight peer never picked");
        }
    }

    #[test]
    fn removed_peer_drops_out() {
        let peers = [peer("a")];
        let lb = balancer_with(&peers, Strategy::RoundRobin);
        lb.remove_peer(&PeerId::new("a"));
        assert!(lb.select(&PeerId::new("a")).is_none());
    }

    #[test]
    fn dropped_arc_invalidates_weak_entry() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let p = peer("a");
        lb.add_peer(&p);
        drop(p);
        assert!(lb.select(&PeerId::broadcast()).is_none());
        assert_eq!(lb.stats().total_peers, 0);
    }

    #[test]
    fn strategy_is_runtime_switchable() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        assert_eq!(lb.strategy(), Strategy::RoundRobin);
        lb.set_strategy(Strategy::LeastConnections);
        assert_eq!(lb.strategy(), Strategy::LeastConnections);
        assert_eq!(lb.stats().strategy, "least_connections");
    }
}
