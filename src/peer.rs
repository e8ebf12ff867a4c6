//! # Peer Records and the Transport Contract
//!
//! A [`Peer`] is the broker-owned record of a remote node: identity,
//! transport address, crypto material, liveness and load-balancing state.
//! The broker's peer table holds the only strong references; protocols keep
//! `Weak<Peer>` handles and tolerate lookup misses after removal.
//!
//! [`PeerTransport`] is the pluggable delivery contract. An adapter is
//! responsible for best-effort delivery only; it never interprets payload
//! bytes. Any successful operation refreshes the peer's last-seen.
//!
//! ## Failure Taxonomy
//!
//! | Variant | Meaning | Recovery |
//! |---------|---------|----------|
//! | [`TransportError::Transient`] | refused connection, timeout | retryable, fed to failover |
//! | [`TransportError::Fatal`] | unresolvable address, protocol mismatch | permanent |

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::crypto::SessionKey;
use crate::identity::{now_ms, PeerId};
use crate::message::Message;

/// A peer counts as connected when seen within this window.
pub const CONNECTED_WINDOW: Duration = Duration::from_secs(10);

/// RSSI above this threshold counts as a strong signal.
pub const STRONG_SIGNAL_RSSI: i8 = -70;

/// Default load-balancing weight of a new peer.
pub const DEFAULT_WEIGHT: u32 = 1;

/// Transport failure, split by whether a retry can help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, timeout, link loss. Retryable; the failover
    /// manager schedules reconnect attempts.
    Transient(String),
    /// Address resolution failure, protocol mismatch. Not retryable.
    Fatal(String),
}

impl TransportError {
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Transient(e) => write!(f, "transient transport failure: {e}"),
            TransportError::Fatal(e) => write!(f, "fatal transport failure: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Pluggable peer transport: best-effort delivery, liveness probing and
/// reconnection. Implementations never inspect payload bytes.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Hand one encoded message to the wire.
    async fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Probe the link.
    async fn health_check(&self) -> Result<(), TransportError>;

    /// Re-establish the link after a failure.
    async fn reconnect(&self) -> Result<(), TransportError>;
}

/// Mutable, lock-protected part of a peer record.
struct PeerState {
    public_key: Option<[u8; 32]>,
    session_key: Option<SessionKey>,
    last_seen: Instant,
    last_seen_ms: u64,
    weight: u32,
    rssi: i8,
}

/// Broker-owned record of a remote node.
///
/// Health and connection count are atomics so the hot paths (selection,
/// probe results) never take the state lock.
pub struct Peer {
    id: PeerId,
    address: String,
    transport: Arc<dyn PeerTransport>,
    healthy: AtomicBool,
    connection_count: AtomicU32,
    state: RwLock<PeerState>,
}

impl Peer {
    pub fn new(id: PeerId, address: impl Into<String>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            id,
            address: address.into(),
            transport,
            healthy: AtomicBool::new(true),
            connection_count: AtomicU32::new(0),
            state: RwLock::new(PeerState {
                public_key: None,
                session_key: None,
                last_seen: Instant::now(),
                last_seen_ms: now_ms(),
                weight: DEFAULT_WEIGHT,
                rssi: 0,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    // ------------------------------------------------------------------
    // Transport operations. Last-seen refreshes on every success.
    // ------------------------------------------------------------------

    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let result = self.transport.send(message).await;
        if result.is_ok() {
            self.touch();
        }
        result
    }

    pub async fn health_check(&self) -> Result<(), TransportError> {
        let result = self.transport.health_check().await;
        if result.is_ok() {
            self.touch();
        }
        result
    }

    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let result = self.transport.reconnect().await;
        if result.is_ok() {
            self.touch();
        }
        result
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Refresh last-seen. Called on any successful transport operation and
    /// on every received frame from this peer.
    pub fn touch(&self) {
        let mut state = self.state.write().expect("peer state lock poisoned");
        state.last_seen = Instant::now();
        state.last_seen_ms = now_ms();
    }

    pub fn is_connected(&self) -> bool {
        let state = self.state.read().expect("peer state lock poisoned");
        state.last_seen.elapsed() < CONNECTED_WINDOW
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Signal quality and load-balancing state
    // ------------------------------------------------------------------

    pub fn rssi(&self) -> i8 {
        self.state.read().expect("peer state lock poisoned").rssi
    }

    pub fn set_rssi(&self, rssi: i8) {
        self.state.write().expect("peer state lock poisoned").rssi = rssi;
    }

    pub fn is_strong_signal(&self) -> bool {
        self.rssi() > STRONG_SIGNAL_RSSI
    }

    pub fn weight(&self) -> u32 {
        self.state.read().expect("peer state lock poisoned").weight
    }

    pub fn set_weight(&self, weight: u32) {
        self.state.write().expect("peer state lock poisoned").weight = weight;
    }

    pub fn connection_count(&self) -> u32 {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn incr_connections(&self) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_connections(&self) {
        // Saturating: a stray decrement must not wrap.
        let _ = self
            .connection_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
    }

    // ------------------------------------------------------------------
    // Crypto material
    // ------------------------------------------------------------------

    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.state.read().expect("peer state lock poisoned").public_key
    }

    pub fn set_public_key(&self, key: [u8; 32]) {
        self.state.write().expect("peer state lock poisoned").public_key = Some(key);
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.state.read().expect("peer state lock poisoned").session_key
    }

    pub fn set_session_key(&self, key: SessionKey) {
        self.state.write().expect("peer state lock poisoned").session_key = Some(key);
    }

    /// Serializable snapshot for stats and external surfaces.
    pub fn snapshot(&self) -> PeerSnapshot {
        let state = self.state.read().expect("peer state lock poisoned");
        PeerSnapshot {
            id: self.id.clone(),
            address: self.address.clone(),
            healthy: self.is_healthy(),
            connected: state.last_seen.elapsed() < CONNECTED_WINDOW,
            last_seen_ms: state.last_seen_ms,
            connection_count: self.connection_count(),
            weight: state.weight,
            rssi: state.rssi,
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a peer record.
#[derive(Clone, Debug, Serialize)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub address: String,
    pub healthy: bool,
    pub connected: bool,
    pub last_seen_ms: u64,
    pub connection_count: u32,
    pub weight: u32,
    pub rssi: i8,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport that records nothing and always succeeds.
    struct NullTransport;

    #[async_trait]
    impl PeerTransport for NullTransport {
        async fn send(&self, _message: &Message) -> Result<(), TransportError> {
            Ok(())
        }
        async fn health_check(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn reconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn test_peer(id: &str) -> Peer {
        Peer::new(PeerId::new(id), "emulated://test", Arc::new(NullTransport))
    }

    #[test]
    fn new_peer_defaults() {
        let peer = test_peer("node-a");
        assert!(peer.is_healthy());
        assert!(peer.is_connected());
        assert_eq!(peer.weight(), DEFAULT_WEIGHT);
        assert_eq!(peer.connection_count(), 0);
        assert!(peer.session_key().is_none());
    }

    #[test]
    fn strong_signal_threshold() {
        let peer = test_peer("node-a");
        peer.set_rssi(-60);
        assert!(peer.is_strong_signal());
        peer.set_rssi(-70);
        assert!(!peer.is_strong_signal());
        peer.set_rssi(-90);
        assert!(!peer.is_strong_signal());
    }

    #[test]
    fn connection_count_never_wraps() {
        let peer = test_peer("node-a");
        peer.decr_connections();
        assert_eq!(peer.connection_count(), 0);
        peer.incr_connections();
        peer.incr_connections();
        peer.decr_connections();
        assert_eq!(peer.connection_count(), 1);
    }

    #[tokio::test]
    async fn successful_send_refreshes_last_seen() {
        let peer = test_peer("node-a");
        let before = peer.snapshot().last_seen_ms;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let msg = Message::health_probe(PeerId::new("me"), PeerId::new("node-a"));
        peer.send(&msg).await.expect("null transport always succeeds");
        assert!(peer.snapshot().last_seen_ms >= before);
        assert!(peer.is_connected());
    }

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Transient("timeout".into()).is_retryable());
        assert!(!TransportError::Fatal("bad address".into()).is_retryable());
    }
}
