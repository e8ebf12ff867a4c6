//! # Mesh Broker
//!
//! The broker owns the peer table, the protocol registry, the load
//! balancer, the failover manager and the channel crypto. Everything else
//! reaches peers through it.
//!
//! ## Locking Discipline
//!
//! Two independent reader-writer locks: one over the peer table, one over
//! the protocol registry. When both are held the order is peer lock first,
//! then protocol lock; the reverse nesting is forbidden. No await happens
//! while either lock is held — data is copied out and the lock released
//! before any network call.
//!
//! ## Channel Crypto
//!
//! Outbound non-health payloads are sealed with AEAD before they reach the
//! transport; inbound frames are opened before protocol dispatch. Unicast
//! traffic uses the per-peer session key when a handshake has established
//! one, the configured bootstrap key otherwise; broadcast frames always use
//! the bootstrap key, so the destination field decides the key space
//! deterministically on both ends. Crypto failures are fail-closed: the
//! frame is dropped, logged and counted, never retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::balancer::{LoadBalancer, LoadBalancerStats};
use crate::config::Config;
use crate::crypto::{
    message_aad, AeadSuite, ChannelCipher, SessionHandshake,
};
use crate::failover::FailoverManager;
use crate::identity::{Keypair, PeerId};
use crate::message::{Message, MessageKind, Payload};
use crate::metrics::{counter, MetricsSink, NullMetrics};
use crate::peer::{Peer, PeerSnapshot};
use crate::protocol::Protocol;

/// Deadline of one broker-initiated outbound operation.
pub const SEND_DEADLINE: Duration = Duration::from_secs(5);

/// Deadline of one health probe.
pub const PROBE_DEADLINE: Duration = Duration::from_secs(5);

/// Central orchestrator of a mesh node.
pub struct Broker {
    node_id: PeerId,
    keypair: Keypair,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    /// Registration order is dispatch order.
    protocols: RwLock<Vec<(String, Arc<dyn Protocol>)>>,
    balancer: LoadBalancer,
    failover: FailoverManager,
    bootstrap_cipher: ChannelCipher,
    suite: AeadSuite,
    metrics: Arc<dyn MetricsSink>,
    health_interval: Duration,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl Broker {
    pub fn new(
        node_id: PeerId,
        keypair: Keypair,
        bootstrap_key: [u8; 32],
        config: &Config,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let suite = AeadSuite::default();
        Arc::new(Self {
            node_id,
            keypair,
            peers: RwLock::new(HashMap::new()),
            protocols: RwLock::new(Vec::new()),
            balancer: LoadBalancer::new(config.balancer_strategy),
            failover: FailoverManager::spawn(config.failover()),
            bootstrap_cipher: ChannelCipher::new(bootstrap_key, suite),
            suite,
            metrics,
            health_interval: config.health_check_interval,
            stop_tx: Mutex::new(None),
        })
    }

    /// Broker with default config and a null metrics sink; test scaffolding
    /// and examples.
    pub fn with_defaults(node_id: PeerId, keypair: Keypair, bootstrap_key: [u8; 32]) -> Arc<Self> {
        Self::new(
            node_id,
            keypair,
            bootstrap_key,
            &Config::default(),
            Arc::new(NullMetrics),
        )
    }

    pub fn node_id(&self) -> &PeerId {
        &self.node_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn failover(&self) -> &FailoverManager {
        &self.failover
    }

    // ------------------------------------------------------------------
    // Peer and protocol registration
    // ------------------------------------------------------------------

    /// Insert a peer into the table, the balancer and every registered
    /// protocol. Idempotent on peer id.
    pub fn add_peer(&self, peer: Arc<Peer>) {
        {
            // Peer lock first, protocol lock nested second (the only legal
            // order). Protocol::add_peer is synchronous; nothing awaits here.
            let mut peers = self.peers.write().expect("peer table lock poisoned");
            if peers.contains_key(peer.id()) {
                return;
            }
            peers.insert(peer.id().clone(), peer.clone());

            let protocols = self.protocols.read().expect("protocol registry lock poisoned");
            for (_, protocol) in protocols.iter() {
                protocol.add_peer(&peer);
            }
        }
        self.balancer.add_peer(&peer);
        info!(peer = %peer.id(), "added peer to broker");
    }

    /// Remove a peer everywhere, cancelling any pending failover retries.
    /// Idempotent.
    pub async fn remove_peer(&self, id: &PeerId) {
        let existed = {
            let mut peers = self.peers.write().expect("peer table lock poisoned");
            let existed = peers.remove(id).is_some();
            if existed {
                let protocols = self.protocols.read().expect("protocol registry lock poisoned");
                for (_, protocol) in protocols.iter() {
                    protocol.remove_peer(id);
                }
            }
            existed
        };
        if existed {
            self.balancer.remove_peer(id);
            self.failover.remove_peer(id).await;
            info!(peer = %id, "removed peer from broker");
        }
    }

    /// Register a protocol and backfill it with the current peers.
    pub fn add_protocol(&self, name: &str, protocol: Arc<dyn Protocol>) {
        let peers = self.peers.read().expect("peer table lock poisoned");
        let mut protocols = self.protocols.write().expect("protocol registry lock poisoned");
        for peer in peers.values() {
            protocol.add_peer(peer);
        }
        protocols.push((name.to_string(), protocol));
        info!(protocol = name, "added protocol to broker");
    }

    pub fn get_peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer table lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.peers
            .read()
            .expect("peer table lock poisoned")
            .values()
            .map(|p| p.snapshot())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("peer table lock poisoned").len()
    }

    // ------------------------------------------------------------------
    // Session establishment
    // ------------------------------------------------------------------

    /// Complete an X25519 handshake with a peer: derive the session key
    /// from our ephemeral secret, their public half and the shared salt,
    /// and pin it to the peer record. Subsequent unicast traffic to and
    /// from that peer uses the session key.
    pub fn establish_session(
        &self,
        peer_id: &PeerId,
        local: &SessionHandshake,
        peer_public: &[u8; 32],
        salt: &[u8],
    ) -> Result<()> {
        let peer = self
            .get_peer(peer_id)
            .with_context(|| format!("peer {peer_id} not in table"))?;
        peer.set_session_key(local.derive(peer_public, salt));
        info!(peer = %peer_id, "session key established");
        Ok(())
    }

    /// Cipher for unicast traffic with one peer: session key when present,
    /// bootstrap otherwise.
    fn unicast_cipher(&self, peer: &Arc<Peer>) -> ChannelCipher {
        match peer.session_key() {
            Some(key) => ChannelCipher::new(key.0, self.suite),
            None => self.bootstrap_cipher.clone(),
        }
    }

    fn seal_payload(&self, message: &mut Message, cipher: &ChannelCipher) -> Result<()> {
        if message.kind == MessageKind::Health {
            return Ok(()); // health frames stay plaintext
        }
        if matches!(message.payload, Payload::Encrypted(_)) {
            return Ok(());
        }
        let plain = message.payload.to_plain_bytes()?;
        let aad = message_aad(&message.id, &message.from);
        let frame = cipher.seal(&plain, &aad)?;
        message.payload = Payload::encrypted(&frame);
        Ok(())
    }

    fn open_payload(&self, message: &mut Message) -> Result<()> {
        if message.kind == MessageKind::Health {
            return Ok(());
        }
        let Some(frame) = message.payload.encrypted_frame() else {
            return Ok(()); // already plaintext (in-process delivery)
        };
        let frame = frame?;

        let cipher = if message.to.is_broadcast() {
            self.bootstrap_cipher.clone()
        } else {
            match self.get_peer(&message.from) {
                Some(peer) => self.unicast_cipher(&peer),
                None => self.bootstrap_cipher.clone(),
            }
        };

        let aad = message_aad(&message.id, &message.from);
        let plain = cipher.open(&frame, &aad)?;
        message.payload = Payload::from_plain_bytes(&plain)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Send paths
    // ------------------------------------------------------------------

    /// Unicast send: the load balancer picks the peer for `message.to`,
    /// the payload is sealed, the transport gets one deadline-bounded try.
    pub async fn send(&self, mut message: Message) -> Result<()> {
        let peer = self
            .balancer
            .select(&message.to)
            .ok_or_else(|| anyhow!("no available peer for destination: {}", message.to))?;

        self.seal_payload(&mut message, &self.unicast_cipher(&peer))?;

        peer.incr_connections();
        let outcome = tokio::time::timeout(SEND_DEADLINE, peer.send(&message)).await;
        peer.decr_connections();

        match outcome {
            Ok(Ok(())) => {
                self.metrics.incr(counter::MESSAGES_SENT);
                Ok(())
            }
            Ok(Err(e)) => {
                self.metrics.incr(counter::TX_ERRORS);
                warn!(peer = %peer.id(), id = %message.id, kind = ?message.kind, error = %e, "send failed");
                if e.is_retryable() {
                    peer.set_healthy(false);
                    self.failover.handle_failure(&peer).await;
                }
                Err(e.into())
            }
            Err(_) => {
                // Deadline expiry is a cancellation, not a transport verdict:
                // the peer record keeps its health state.
                self.metrics.incr(counter::TX_ERRORS);
                bail!("send to {} exceeded {:?} deadline", peer.id(), SEND_DEADLINE)
            }
        }
    }

    /// Fan a message out to every peer. Per-peer errors are logged and
    /// counted; the fanout never short-circuits.
    pub async fn broadcast(&self, mut message: Message) -> Result<()> {
        message.to = PeerId::broadcast();
        self.seal_payload(&mut message, &self.bootstrap_cipher)?;

        let peers: Vec<Arc<Peer>> = {
            let peers = self.peers.read().expect("peer table lock poisoned");
            peers.values().cloned().collect()
        };

        for peer in peers {
            match tokio::time::timeout(SEND_DEADLINE, peer.send(&message)).await {
                Ok(Ok(())) => {
                    self.metrics.incr(counter::MESSAGES_SENT);
                }
                Ok(Err(e)) => {
                    self.metrics.incr(counter::TX_ERRORS);
                    error!(peer = %peer.id(), id = %message.id, error = %e, "broadcast to peer failed");
                }
                Err(_) => {
                    self.metrics.incr(counter::TX_ERRORS);
                    error!(peer = %peer.id(), id = %message.id, "broadcast to peer timed out");
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Decrypt an inbound frame and dispatch it to every registered
    /// protocol in registration order. Crypto failures drop the frame
    /// before any dispatch; a protocol error never stops the neighbors.
    pub async fn handle_incoming(&self, mut message: Message) -> Result<()> {
        if let Some(peer) = self.get_peer(&message.from) {
            peer.touch();
        }

        if let Err(e) = self.open_payload(&mut message) {
            self.metrics.incr(counter::RX_CRYPTO_ERRORS);
            warn!(
                peer = %message.from,
                id = %message.id,
                kind = ?message.kind,
                error = %e,
                "dropping undecryptable frame"
            );
            return Err(e);
        }
        self.metrics.incr(counter::MESSAGES_RECEIVED);

        let protocols: Vec<(String, Arc<dyn Protocol>)> = {
            let protocols = self.protocols.read().expect("protocol registry lock poisoned");
            protocols.clone()
        };

        for (name, protocol) in protocols {
            if let Err(e) = protocol.handle_incoming(&message).await {
                self.metrics.incr(counter::PROTOCOL_ERRORS);
                error!(
                    protocol = %name,
                    peer = %message.from,
                    id = %message.id,
                    kind = ?message.kind,
                    error = %e,
                    "protocol failed to handle message"
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Health checking
    // ------------------------------------------------------------------

    /// Start the periodic health loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.stop_tx.lock().expect("broker stop lock poisoned");
        if guard.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *guard = Some(stop_tx);

        let broker = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(broker.health_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!("broker health loop quitting");
                        break;
                    }
                    _ = tick.tick() => {
                        broker.run_health_checks().await;
                    }
                }
            }
        });
        info!(node = %self.node_id, "started mesh broker");
    }

    /// Stop the health loop and the failover actor.
    pub async fn shutdown(&self) {
        if let Some(stop) = self
            .stop_tx
            .lock()
            .expect("broker stop lock poisoned")
            .take()
        {
            let _ = stop.send(true);
        }
        self.failover.quit().await;
        info!(node = %self.node_id, "stopped mesh broker");
    }

    /// Probe every peer concurrently, each under its own deadline. A
    /// reported failure (or an expired probe) degrades the peer and feeds
    /// the failover manager.
    pub async fn run_health_checks(&self) {
        let peers: Vec<Arc<Peer>> = {
            let peers = self.peers.read().expect("peer table lock poisoned");
            peers.values().cloned().collect()
        };
        if peers.is_empty() {
            return;
        }

        let mut probes = JoinSet::new();
        for peer in peers {
            probes.spawn(async move {
                let ok = tokio::time::timeout(PROBE_DEADLINE, peer.health_check())
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                (peer, ok)
            });
        }

        while let Some(result) = probes.join_next().await {
            let Ok((peer, ok)) = result else { continue };
            if ok {
                peer.set_healthy(true);
            } else {
                warn!(peer = %peer.id(), "peer health check failed");
                self.metrics.incr(counter::HEALTH_FAILURES);
                peer.set_healthy(false);
                self.failover.handle_failure(&peer).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn balancer_stats(&self) -> LoadBalancerStats {
        self.balancer.stats()
    }

    /// Aggregated stats snapshot: broker counts plus every component's own
    /// view, keyed `protocol_<name>` for registered protocols.
    pub async fn stats(&self) -> serde_json::Value {
        let protocol_list: Vec<(String, Arc<dyn Protocol>)> = {
            let protocols = self.protocols.read().expect("protocol registry lock poisoned");
            protocols.clone()
        };

        let mut stats = serde_json::Map::new();
        stats.insert("node_id".into(), serde_json::json!(self.node_id.as_str()));
        stats.insert("peers".into(), serde_json::json!(self.peer_count()));
        stats.insert("protocols".into(), serde_json::json!(protocol_list.len()));
        stats.insert(
            "load_balancer".into(),
            serde_json::to_value(self.balancer.stats()).unwrap_or_default(),
        );
        if let Some(failover) = self.failover.stats().await {
            stats.insert(
                "failover".into(),
                serde_json::to_value(failover).unwrap_or_default(),
            );
        }
        for (name, protocol) in protocol_list {
            stats.insert(format!("protocol_{name}"), protocol.stats());
        }
        serde_json::Value::Object(stats)
    }
}
