//! # Failover Manager
//!
//! Tracks failing peers and drives bounded reconnection. One failure record
//! exists per failing peer; retries are scheduled on a single delayed-work
//! queue keyed by peer id, so removing a peer deterministically cancels its
//! pending retries (no task is spawned per retry).
//!
//! ## State Machine (per peer)
//!
//! ```text
//! Healthy -(failure)-> Failing(n)
//! Failing(n) -(reconnect ok)->   Healthy            (record removed)
//! Failing(n) -(reconnect fail)-> Failing(n+1)
//! Failing(n >= max_retries) ->   PermanentlyFailed
//! PermanentlyFailed -(cleanup, idle > 2 x retry_interval)-> removed
//! ```
//!
//! The cleanup sweep runs on the retry interval and garbage-collects
//! permanently-failed records once they have been idle for twice the retry
//! interval.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::identity::{now_ms, PeerId};
use crate::peer::Peer;

/// Default pause between reconnect attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of reconnect attempts before a peer is declared
/// permanently failed.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Deadline of a single reconnect attempt.
const RECONNECT_DEADLINE: Duration = Duration::from_secs(5);

/// Failover tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct FailoverConfig {
    pub retry_interval: Duration,
    pub max_retries: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Point-in-time view of one failure record.
#[derive(Clone, Debug, Serialize)]
pub struct FailedPeerSnapshot {
    pub id: PeerId,
    pub failure_time_ms: u64,
    pub retry_count: u32,
    pub last_retry_ms: u64,
    pub permanently_failed: bool,
}

/// Failover counters for the stats surface.
#[derive(Clone, Debug, Serialize)]
pub struct FailoverStats {
    pub failed_peers: usize,
    pub permanently_failed: usize,
    pub total_retries: u64,
    pub retry_interval_secs: u64,
    pub max_retries: u32,
}

enum Command {
    Failure(Weak<Peer>),
    Remove(PeerId),
    IsFailed(PeerId, oneshot::Sender<bool>),
    Snapshot(oneshot::Sender<Vec<FailedPeerSnapshot>>),
    Stats(oneshot::Sender<FailoverStats>),
    ReconnectOutcome(PeerId, bool),
    Quit,
}

/// Handle to the failover actor. Cheap to clone.
#[derive(Clone)]
pub struct FailoverManager {
    cmd_tx: mpsc::Sender<Command>,
}

impl FailoverManager {
    pub fn spawn(config: FailoverConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let actor = FailoverActor {
            config,
            records: HashMap::new(),
            queue: BinaryHeap::new(),
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Report a peer failure. Looks up or creates the failure record,
    /// advances its retry count and schedules the next reconnect (or marks
    /// the peer permanently failed once the budget is spent).
    pub async fn handle_failure(&self, peer: &Arc<Peer>) {
        let _ = self
            .cmd_tx
            .send(Command::Failure(Arc::downgrade(peer)))
            .await;
    }

    /// Drop the record and cancel any pending retry for this peer.
    pub async fn remove_peer(&self, id: &PeerId) {
        let _ = self.cmd_tx.send(Command::Remove(id.clone())).await;
    }

    pub async fn is_failed(&self, id: &PeerId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::IsFailed(id.clone(), tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn failed_peers(&self) -> Vec<FailedPeerSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> Option<FailoverStats> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Stats(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

struct FailedRecord {
    peer: Weak<Peer>,
    failure_at_ms: u64,
    retry_count: u32,
    last_retry: Instant,
    last_retry_ms: u64,
    permanent: bool,
}

struct FailoverActor {
    config: FailoverConfig,
    records: HashMap<PeerId, FailedRecord>,
    /// Min-heap of pending retry deadlines. Entries whose record has been
    /// removed are skipped on pop; that is how `remove_peer` cancels.
    queue: BinaryHeap<Reverse<(Instant, PeerId)>>,
    cmd_tx: mpsc::Sender<Command>,
}

impl FailoverActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut cleanup_tick = tokio::time::interval(self.config.retry_interval);
        // The first tick of a tokio interval fires immediately; skip it so
        // the cleanup cadence starts one interval out.
        cleanup_tick.tick().await;

        loop {
            let next_deadline = self.queue.peek().map(|Reverse((at, _))| *at);

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Failure(weak)) => self.on_failure(weak),
                        Some(Command::Remove(id)) => {
                            self.records.remove(&id);
                            debug!(peer = %id, "removed peer from failover manager");
                        }
                        Some(Command::IsFailed(id, reply)) => {
                            let _ = reply.send(self.records.contains_key(&id));
                        }
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(Command::Stats(reply)) => {
                            let _ = reply.send(self.stats());
                        }
                        Some(Command::ReconnectOutcome(id, ok)) => self.on_outcome(id, ok),
                        Some(Command::Quit) | None => {
                            debug!("failover manager quitting");
                            break;
                        }
                    }
                }
                _ = cleanup_tick.tick() => {
                    self.cleanup();
                }
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(|| {
                        Instant::now() + Duration::from_secs(3600)
                    })), if next_deadline.is_some() => {
                    self.fire_due_retries();
                }
            }
        }
    }

    fn on_failure(&mut self, weak: Weak<Peer>) {
        let Some(peer) = weak.upgrade() else {
            return; // peer already removed from the table
        };
        let id = peer.id().clone();

        let record = self.records.entry(id.clone()).or_insert_with(|| FailedRecord {
            peer: weak,
            failure_at_ms: now_ms(),
            retry_count: 0,
            last_retry: Instant::now(),
            last_retry_ms: now_ms(),
            permanent: false,
        });

        if record.permanent {
            return;
        }

        record.retry_count += 1;
        record.last_retry = Instant::now();
        record.last_retry_ms = now_ms();

        warn!(
            peer = %id,
            retry_count = record.retry_count,
            max_retries = self.config.max_retries,
            "peer failure handled"
        );

        if record.retry_count >= self.config.max_retries {
            record.permanent = true;
            warn!(peer = %id, "peer exceeded max retries, marking permanently failed");
            return;
        }

        let deadline = Instant::now() + self.config.retry_interval;
        self.queue.push(Reverse((deadline, id)));
    }

    fn fire_due_retries(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, _))) = self.queue.peek() {
            if *at > now {
                break;
            }
            let Reverse((_, id)) = self.queue.pop().expect("peeked entry exists");

            // A missing or permanent record means the retry was cancelled.
            let Some(record) = self.records.get(&id) else {
                continue;
            };
            if record.permanent {
                continue;
            }
            let Some(peer) = record.peer.upgrade() else {
                self.records.remove(&id);
                continue;
            };

            let outcome_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let ok = tokio::time::timeout(RECONNECT_DEADLINE, peer.reconnect())
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                if ok {
                    peer.set_healthy(true);
                }
                let id = peer.id().clone();
                let _ = outcome_tx.send(Command::ReconnectOutcome(id, ok)).await;
            });
        }
    }

    fn on_outcome(&mut self, id: PeerId, ok: bool) {
        if ok {
            if self.records.remove(&id).is_some() {
                info!(peer = %id, "peer successfully reconnected");
            }
            return;
        }

        debug!(peer = %id, "peer reconnection failed");
        let weak = match self.records.get(&id) {
            Some(record) => record.peer.clone(),
            None => return, // removed while the attempt was in flight
        };
        self.on_failure(weak);
    }

    /// Invariant I5: permanently-failed records idle for more than twice the
    /// retry interval are garbage-collected.
    fn cleanup(&mut self) {
        let horizon = self.config.retry_interval * 2;
        let before = self.records.len();
        self.records
            .retain(|_, r| !(r.permanent && r.last_retry.elapsed() > horizon));
        let removed = before - self.records.len();
        if removed > 0 {
            info!(removed, "cleaned up permanently failed peers");
        }
    }

    fn snapshot(&self) -> Vec<FailedPeerSnapshot> {
        self.records
            .iter()
            .map(|(id, r)| FailedPeerSnapshot {
                id: id.clone(),
                failure_time_ms: r.failure_at_ms,
                retry_count: r.retry_count,
                last_retry_ms: r.last_retry_ms,
                permanently_failed: r.permanent,
            })
            .collect()
    }

    fn stats(&self) -> FailoverStats {
        FailoverStats {
            failed_peers: self.records.len(),
            permanently_failed: self.records.values().filter(|r| r.permanent).count(),
            total_retries: self.records.values().map(|r| r.retry_count as u64).sum(),
            retry_interval_secs: self.config.retry_interval.as_secs(),
            max_retries: self.config.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::peer::{PeerTransport, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Transport whose reconnect fails `fail_first` times, then succeeds.
    struct FlakyTransport {
        attempts: AtomicU32,
        fail_first: u32,
    }

    impl FlakyTransport {
        fn new(fail_first: u32) -> Self {
            Self {
                attempts: AtomicU32::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl PeerTransport for FlakyTransport {
        async fn send(&self, _m: &Message) -> Result<(), TransportError> {
            Ok(())
        }
        async fn health_check(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn reconnect(&self) -> Result<(), TransportError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(TransportError::Transient("still down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn failing_peer(id: &str, fail_first: u32) -> Arc<Peer> {
        let peer = Arc::new(Peer::new(
            PeerId::new(id),
            format!("emulated://{id}"),
            Arc::new(FlakyTransport::new(fail_first)),
        ));
        peer.set_healthy(false);
        peer
    }

    fn quick_config() -> FailoverConfig {
        FailoverConfig {
            retry_interval: Duration::from_millis(50),
            max_retries: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_on_third_attempt() {
        let manager = FailoverManager::spawn(quick_config());
        let peer = failing_peer("node-p", 2);

        manager.handle_failure(&peer).await;
        assert!(manager.is_failed(peer.id()).await);

        // Two failing retries, then success on the third.
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(!manager.is_failed(peer.id()).await, "record removed on recovery");
        assert!(peer.is_healthy(), "peer marked healthy after reconnect");
        manager.quit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_counts_stay_bounded() {
        let manager = FailoverManager::spawn(quick_config());
        let peer = failing_peer("node-p", u32::MAX);

        manager.handle_failure(&peer).await;
        // Long enough to spend the whole retry budget, short of the cleanup
        // horizon (2 x retry_interval past the last attempt).
        tokio::time::sleep(Duration::from_millis(260)).await;

        let snapshot = manager.failed_peers().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].permanently_failed);
        assert!(snapshot[0].retry_count <= quick_config().max_retries + 1);
        assert!(!peer.is_healthy());
        manager.quit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_records_are_garbage_collected() {
        let manager = FailoverManager::spawn(quick_config());
        let peer = failing_peer("node-p", u32::MAX);

        manager.handle_failure(&peer).await;
        // Burn through the retry budget, then idle past 2 x retry_interval
        // so the cleanup sweep collects the record.
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!manager.is_failed(peer.id()).await, "record cleaned up");
        manager.quit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn remove_peer_cancels_pending_retry() {
        let manager = FailoverManager::spawn(quick_config());
        let peer = failing_peer("node-p", u32::MAX);

        manager.handle_failure(&peer).await;
        manager.remove_peer(peer.id()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!manager.is_failed(peer.id()).await);
        let snapshot = manager.failed_peers().await;
        assert!(snapshot.is_empty(), "no record survives removal");
        manager.quit().await;
    }
}
