//! # Controlled Flooding
//!
//! Forwards each message to every known peer at most once, bounded by the
//! message's TTL, the protocol's hop limit, and a dedup cache keyed by
//! message id.
//!
//! ## Forwarding Rule
//!
//! For a received or locally-broadcast message `m`:
//!
//! 1. Drop if `m.ttl <= 0` or `m.hops >= max_hops`.
//! 2. Drop if the dedup cache holds `m.id` within the retention window.
//! 3. Record `m.id`.
//! 4. Forward `m'` (ttl-1, hops+1, path + self) to every peer not already
//!    on the path.
//!
//! Every reachable peer receives `m` at least once; each node forwards it
//! at most once per retention window. TTL strictly decreases and hops
//! strictly increase on every forward.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::identity::PeerId;
use crate::message::{Message, MessageKind};
use crate::peer::Peer;
use crate::protocol::{PeerRoster, Protocol, ProtocolError};

/// Hard capacity of the dedup cache. Together with the retention window
/// this bounds memory at ttl x arrival rate.
pub const DEDUP_CACHE_CAPACITY: usize = 8192;

/// Default dedup retention window.
pub const DEFAULT_FLOOD_TTL: Duration = Duration::from_secs(60);

/// Default hop budget.
pub const DEFAULT_MAX_HOPS: u32 = 10;

/// Flooding parameters.
#[derive(Clone, Copy, Debug)]
pub struct FloodingConfig {
    /// Dedup cache retention window.
    pub ttl: Duration,
    /// Drop threshold on the hop counter.
    pub max_hops: u32,
}

impl Default for FloodingConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_FLOOD_TTL,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

/// Controlled-flooding dissemination.
pub struct FloodingProtocol {
    node_id: PeerId,
    config: FloodingConfig,
    roster: PeerRoster,
    /// Message id -> first-seen time. The cache is the only authority on
    /// "seen"; entries age out at `config.ttl`.
    seen: Mutex<LruCache<Uuid, Instant>>,
    delivery_tx: mpsc::Sender<Message>,
}

impl FloodingProtocol {
    pub fn new(node_id: PeerId, config: FloodingConfig, delivery_tx: mpsc::Sender<Message>) -> Self {
        let capacity = NonZeroUsize::new(DEDUP_CACHE_CAPACITY).expect("capacity is non-zero");
        Self {
            node_id,
            config,
            roster: PeerRoster::new(),
            seen: Mutex::new(LruCache::new(capacity)),
            delivery_tx,
        }
    }

    /// Start flooding a locally-originated message.
    pub async fn broadcast(&self, message: &Message) {
        self.flood(message).await;
    }

    /// Returns true when the id was recorded (first sighting within the
    /// retention window), false when it is a fresh duplicate.
    fn record_first_sighting(&self, id: Uuid) -> bool {
        let mut seen = self.seen.lock().expect("dedup cache lock poisoned");
        if let Some(at) = seen.get(&id) {
            if at.elapsed() <= self.config.ttl {
                return false;
            }
            seen.pop(&id);
        }
        seen.put(id, Instant::now());
        true
    }

    async fn flood(&self, message: &Message) {
        if message.is_expired() || message.hops >= self.config.max_hops {
            debug!(
                id = %message.id,
                ttl = message.ttl,
                hops = message.hops,
                "dropping message with exhausted budget"
            );
            return;
        }

        if !self.record_first_sighting(message.id) {
            debug!(id = %message.id, "suppressing duplicate");
            return;
        }

        self.deliver_locally(message).await;

        // Copy the targets out before any await; never hold the roster
        // lock across a send.
        let targets: Vec<Arc<Peer>> = self
            .roster
            .alive()
            .into_iter()
            .filter(|p| !message.path.contains(p.id()))
            .collect();

        let outgoing = message.forwarded(&self.node_id);
        for peer in targets {
            if let Err(e) = peer.send(&outgoing).await {
                warn!(peer = %peer.id(), id = %message.id, error = %e, "flood forward failed");
                continue;
            }
            debug!(peer = %peer.id(), id = %message.id, hops = outgoing.hops, "flooded message");
        }
    }

    /// Hand a chat message addressed to this node (or broadcast) to the
    /// application, once per dedup window.
    async fn deliver_locally(&self, message: &Message) {
        if message.kind != MessageKind::Chat {
            return;
        }
        if message.to != self.node_id && !message.to.is_broadcast() {
            return;
        }
        if message.from == self.node_id {
            return;
        }
        if let Err(e) = self.delivery_tx.try_send(message.clone()) {
            warn!(id = %message.id, error = %e, "application delivery queue full, dropping");
        }
    }

    /// Drop aged-out dedup entries.
    pub fn cleanup(&self) {
        let mut seen = self.seen.lock().expect("dedup cache lock poisoned");
        let ttl = self.config.ttl;
        // LruCache has no retain; collect expired keys first.
        let expired: Vec<Uuid> = seen
            .iter()
            .filter(|(_, at)| at.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            seen.pop(&id);
        }
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.seen.lock().expect("dedup cache lock poisoned").len()
    }
}

#[async_trait]
impl Protocol for FloodingProtocol {
    fn name(&self) -> &'static str {
        "flooding"
    }

    fn add_peer(&self, peer: &Arc<Peer>) {
        self.roster.add(peer);
        debug!(peer = %peer.id(), "added peer to flooding protocol");
    }

    fn remove_peer(&self, id: &PeerId) {
        self.roster.remove(id);
        debug!(peer = %id, "removed peer from flooding protocol");
    }

    async fn handle_incoming(&self, message: &Message) -> Result<(), ProtocolError> {
        // Flooding carries chat and control traffic; the other kinds belong
        // to their own protocols.
        if !matches!(message.kind, MessageKind::Chat | MessageKind::Control) {
            return Ok(());
        }
        self.flood(message).await;
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        let snapshot = FloodingStats {
            peers: self.roster.len(),
            cache_size: self.seen.lock().expect("dedup cache lock poisoned").len(),
            ttl_secs: self.config.ttl.as_secs(),
            max_hops: self.config.max_hops,
        };
        serde_json::to_value(snapshot).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct FloodingStats {
    peers: usize,
    cache_size: usize,
    ttl_secs: u64,
    max_hops: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Priority;
    use crate::transport::{EmulatedNetwork, EmulatedTransport, LinkProfile};

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

    fn flood_under_test(node: &str) -> (FloodingProtocol, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        (
            FloodingProtocol::new(PeerId::new(node), FloodingConfig::default(), tx),
            rx,
        )
    }

    fn chat_to(to: &str) -> Message {
        Message::chat(
            PeerId::new("origin"),
            PeerId::new(to),
            b"flood me".to_vec(),
            Priority::Normal,
        )
    }

    #[tokio::test]
    async fn forwards_once_and_suppresses_duplicates() {
        let hub = EmulatedNetwork::new();
        let mut inbox_b = hub.attach(PeerId::new("b"));

        let (flood, _rx) = flood_under_test("a");
        flood.add_peer(&hub_peer(&hub, "b"));

        let msg = chat_to("broadcast");
        flood.handle_incoming(&msg).await.expect("chat accepted");
        flood.handle_incoming(&msg).await.expect("duplicate dropped silently");

        let first = inbox_b.recv().await.expect("forwarded once");
        assert_eq!(first.id, msg.id);
        assert_eq!(first.ttl, msg.ttl - 1);
        assert_eq!(first.hops, msg.hops + 1);
        assert!(first.path.contains(&PeerId::new("a")));

        // No second delivery.
        assert!(inbox_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_budget_is_dropped() {
        let hub = EmulatedNetwork::new();
        let mut inbox_b = hub.attach(PeerId::new("b"));
        let (flood, _rx) = flood_under_test("a");
        flood.add_peer(&hub_peer(&hub, "b"));

        let mut dead = chat_to("broadcast");
        dead.ttl = 0;
        flood.handle_incoming(&dead).await.expect("handled");

        let mut hopped_out = chat_to("broadcast");
        hopped_out.hops = DEFAULT_MAX_HOPS;
        flood.handle_incoming(&hopped_out).await.expect("handled");

        assert!(inbox_b.try_recv().is_err());
        assert_eq!(flood.cache_len(), 0, "dropped messages never enter the cache");
    }

    #[tokio::test]
    async fn peers_on_the_path_are_skipped() {
        let hub = EmulatedNetwork::new();
        let mut inbox_b = hub.attach(PeerId::new("b"));
        let mut inbox_c = hub.attach(PeerId::new("c"));

        let (flood, _rx) = flood_under_test("a");
        flood.add_peer(&hub_peer(&hub, "b"));
        flood.add_peer(&hub_peer(&hub, "c"));

        let mut msg = chat_to("broadcast");
        msg.path.push(PeerId::new("b"));
        flood.handle_incoming(&msg).await.expect("handled");

        assert!(inbox_b.try_recv().is_err(), "b already saw the message");
        assert!(inbox_c.recv().await.is_some(), "c still gets it");
    }

    #[tokio::test]
    async fn delivers_addressed_chat_to_application() {
        let (flood, mut delivered) = flood_under_test("a");

        let direct = chat_to("a");
        flood.handle_incoming(&direct).await.expect("handled");
        assert_eq!(delivered.recv().await.expect("delivered").id, direct.id);

        let broadcast = chat_to("broadcast");
        flood.handle_incoming(&broadcast).await.expect("handled");
        assert_eq!(delivered.recv().await.expect("delivered").id, broadcast.id);

        let elsewhere = chat_to("z");
        flood.handle_incoming(&elsewhere).await.expect("handled");
        assert!(delivered.try_recv().is_err(), "not addressed to us");
    }

    #[tokio::test]
    async fn non_chat_kinds_are_ignored() {
        let hub = EmulatedNetwork::new();
        let mut inbox_b = hub.attach(PeerId::new("b"));
        let (flood, _rx) = flood_under_test("a");
        flood.add_peer(&hub_peer(&hub, "b"));

        let probe = Message::health_probe(PeerId::new("origin"), PeerId::new("a"));
        flood.handle_incoming(&probe).await.expect("ignored");
        assert!(inbox_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn cleanup_evicts_aged_entries() {
        let (tx, _rx) = mpsc::channel(8);
        let flood = FloodingProtocol::new(
            PeerId::new("a"),
            FloodingConfig {
                ttl: Duration::from_millis(1),
                max_hops: 5,
            },
            tx,
        );

        let msg = chat_to("broadcast");
        flood.handle_incoming(&msg).await.expect("handled");
        assert_eq!(flood.cache_len(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        flood.cleanup();
        assert_eq!(flood.cache_len(), 0);
    }

    #[tokio::test]
    async fn aged_out_entry_allows_reforward() {
        let hub = EmulatedNetwork::new();
        let mut inbox_b = hub.attach(PeerId::new("b"));
        let (tx, _rx) = mpsc::channel(8);
        let flood = FloodingProtocol::new(
            PeerId::new("a"),
            FloodingConfig {
                ttl: Duration::from_millis(1),
                max_hops: 5,
            },
            tx,
        );
        flood.add_peer(&hub_peer(&hub, "b"));

        let msg = chat_to("broadcast");
        flood.handle_incoming(&msg).await.expect("handled");
        assert!(inbox_b.recv().await.is_some());

        tokio::time::sleep(Duration::from_millis(10)).await;
        flood.handle_incoming(&msg).await.expect("handled");
        assert!(
            inbox_b.recv().await.is_some(),
            "entry aged out, message forwards again"
        );
    }
}
