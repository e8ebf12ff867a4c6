//! # Probabilistic Gossip
//!
//! Periodically re-propagates cached records to a random subset of peers
//! until each record has been gossiped for `max_rounds` rounds.
//!
//! ## Round Discipline
//!
//! Every record carries a round counter, transmitted in decimal and
//! strictly monotone per message id: a received record replaces the cached
//! one only when its round is strictly greater; equal or lower rounds are
//! dropped. A record stops propagating once its round reaches `max_rounds`,
//! which bounds termination.
//!
//! ## Tick
//!
//! Each tick selects up to `fanout` peers by Fisher-Yates shuffle of the
//! current peer set and sends them every live record with the round
//! incremented; the cache entry advances to the incremented round.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::identity::{now_ms, PeerId};
use crate::message::{GossipRecord, Message, MessageKind, Payload};
use crate::peer::Peer;
use crate::protocol::{PeerRoster, Protocol, ProtocolError};

/// Hard capacity of the record cache.
pub const GOSSIP_CACHE_CAPACITY: usize = 4096;

/// Default number of peers targeted per tick.
pub const DEFAULT_FANOUT: usize = 3;

/// Default tick interval.
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(2);

/// Default round budget per record.
pub const DEFAULT_MAX_ROUNDS: u32 = 5;

/// Gossip parameters.
#[derive(Clone, Copy, Debug)]
pub struct GossipConfig {
    pub fanout: usize,
    pub interval: Duration,
    pub max_rounds: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_FANOUT,
            interval: DEFAULT_GOSSIP_INTERVAL,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

struct CachedRecord {
    round: u32,
    first_seen_ms: u64,
    data: Vec<u8>,
}

struct GossipInner {
    node_id: PeerId,
    config: GossipConfig,
    roster: PeerRoster,
    records: Mutex<LruCache<Uuid, CachedRecord>>,
    delivery_tx: mpsc::Sender<Message>,
}

impl GossipInner {
    /// One tick: re-send every record still under the round budget to a
    /// random fanout of peers.
    async fn perform_gossip(&self) {
        // Copy live records out under the lock, release before sending.
        let live: Vec<(Uuid, GossipRecord)> = {
            let records = self.records.lock().expect("gossip cache lock poisoned");
            records
                .iter()
                .filter(|(_, r)| r.round < self.config.max_rounds)
                .map(|(id, r)| {
                    (
                        *id,
                        GossipRecord {
                            origin_id: *id,
                            round: r.round + 1,
                            first_seen_ms: r.first_seen_ms,
                            data: r.data.clone(),
                        },
                    )
                })
                .collect()
        };
        if live.is_empty() {
            return;
        }

        let targets = self.select_fanout();
        if targets.is_empty() {
            return;
        }

        for (id, record) in live {
            for peer in &targets {
                let message = Message::new(
                    MessageKind::Gossip,
                    self.node_id.clone(),
                    peer.id().clone(),
                    Payload::GossipRecord(record.clone()),
                );
                if let Err(e) = peer.send(&message).await {
                    warn!(peer = %peer.id(), id = %id, error = %e, "gossip send failed");
                    continue;
                }
                debug!(peer = %peer.id(), id = %id, round = record.round, "gossiped record");
            }

            // Advance the cached round to what was just transmitted.
            let mut records = self.records.lock().expect("gossip cache lock poisoned");
            if let Some(cached) = records.get_mut(&id) {
                if cached.round < record.round {
                    cached.round = record.round;
                }
            }
        }
    }

    /// Fisher-Yates partial shuffle of the current peer set.
    fn select_fanout(&self) -> Vec<Arc<Peer>> {
        let mut peers = self.roster.alive();
        let n = peers.len();
        if n == 0 {
            return peers;
        }
        let take = self.config.fanout.min(n);
        for i in 0..take {
            let j = OsRng.gen_range(i..n);
            peers.swap(i, j);
        }
        peers.truncate(take);
        peers
    }

    /// Insert or advance a record. Returns true on first sighting of the id.
    fn observe(&self, record: &GossipRecord) -> bool {
        let mut records = self.records.lock().expect("gossip cache lock poisoned");
        match records.get_mut(&record.origin_id) {
            Some(cached) => {
                // Rounds are strictly monotone per id; equal or lower is a replay.
                if cached.round < record.round {
                    cached.round = record.round;
                }
                false
            }
            None => {
                records.put(
                    record.origin_id,
                    CachedRecord {
                        round: record.round,
                        first_seen_ms: record.first_seen_ms,
                        data: record.data.clone(),
                    },
                );
                true
            }
        }
    }
}

/// Bounded-round gossip dissemination.
pub struct GossipProtocol {
    inner: Arc<GossipInner>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl GossipProtocol {
    pub fn new(node_id: PeerId, config: GossipConfig, delivery_tx: mpsc::Sender<Message>) -> Self {
        let capacity = NonZeroUsize::new(GOSSIP_CACHE_CAPACITY).expect("capacity is non-zero");
        Self {
            inner: Arc::new(GossipInner {
                node_id,
                config,
                roster: PeerRoster::new(),
                records: Mutex::new(LruCache::new(capacity)),
                delivery_tx,
            }),
            stop_tx: Mutex::new(None),
        }
    }

    /// Start the periodic gossip tick. Idempotent.
    pub fn start(&self) {
        let mut guard = self.stop_tx.lock().expect("gossip stop lock poisoned");
        if guard.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *guard = Some(stop_tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.config.interval);
            tick.tick().await; // the immediate first tick carries nothing new
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!("gossip tick loop quitting");
                        break;
                    }
                    _ = tick.tick() => {
                        inner.perform_gossip().await;
                    }
                }
            }
        });
    }

    /// Stop the periodic tick.
    pub fn stop(&self) {
        if let Some(stop) = self
            .stop_tx
            .lock()
            .expect("gossip stop lock poisoned")
            .take()
        {
            let _ = stop.send(true);
        }
    }

    /// Seed a locally-originated message into the gossip cache at round 0.
    pub fn broadcast(&self, message: &Message) -> Result<(), ProtocolError> {
        let data = message
            .payload
            .to_plain_bytes()
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.inner.observe(&GossipRecord {
            origin_id: message.id,
            round: 0,
            first_seen_ms: now_ms(),
            data,
        });
        debug!(id = %message.id, "started gossip broadcast");
        Ok(())
    }

    /// Whether the record cache holds this message id.
    pub fn has_record(&self, id: &Uuid) -> bool {
        self.inner
            .records
            .lock()
            .expect("gossip cache lock poisoned")
            .contains(id)
    }

    /// Cached round for a message id, if present.
    pub fn record_round(&self, id: &Uuid) -> Option<u32> {
        self.inner
            .records
            .lock()
            .expect("gossip cache lock poisoned")
            .peek(id)
            .map(|r| r.round)
    }

    #[cfg(test)]
    async fn tick_once(&self) {
        self.inner.perform_gossip().await;
    }
}

#[async_trait]
impl Protocol for GossipProtocol {
    fn name(&self) -> &'static str {
        "gossip"
    }

    fn add_peer(&self, peer: &Arc<Peer>) {
        self.inner.roster.add(peer);
        debug!(peer = %peer.id(), "added peer to gossip protocol");
    }

    fn remove_peer(&self, id: &PeerId) {
        self.inner.roster.remove(id);
        debug!(peer = %id, "removed peer from gossip protocol");
    }

    async fn handle_incoming(&self, message: &Message) -> Result<(), ProtocolError> {
        if message.kind != MessageKind::Gossip {
            return Ok(());
        }
        let record = match &message.payload {
            Payload::GossipRecord(record) => record,
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "gossip frame with {:?} payload",
                    std::mem::discriminant(other)
                )))
            }
        };

        if self.inner.observe(record) {
            debug!(id = %record.origin_id, round = record.round, "received new gossip record");
            if let Err(e) = self.inner.delivery_tx.try_send(message.clone()) {
                warn!(id = %record.origin_id, error = %e, "gossip delivery queue full, dropping");
            }
        }
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        let snapshot = GossipStats {
            peers: self.inner.roster.len(),
            cache_size: self
                .inner
                .records
                .lock()
                .expect("gossip cache lock poisoned")
                .len(),
            fanout: self.inner.config.fanout,
            interval_ms: self.inner.config.interval.as_millis() as u64,
            max_rounds: self.inner.config.max_rounds,
        };
        serde_json::to_value(snapshot).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct GossipStats {
    peers: usize,
    cache_size: usize,
    fanout: usize,
    interval_ms: u64,
    max_rounds: u32,
}
