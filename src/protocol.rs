//! # Dissemination Protocol Contract
//!
//! Every dissemination strategy (flooding, gossip, consensus) implements
//! [`Protocol`]. The broker dispatches each decrypted inbound message to
//! every registered protocol in registration order; a protocol that cannot
//! decode a payload returns [`ProtocolError::Malformed`] and the broker
//! continues with the remaining protocols.
//!
//! Protocols hold only weak references to peers ([`PeerRoster`]); the
//! broker's peer table is the sole owner, so removing a peer immediately
//! invalidates the roster entry and lookups simply miss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use crate::identity::PeerId;
use crate::message::Message;
use crate::peer::Peer;

/// Error a protocol reports for one message. The message is dropped;
/// neighboring protocol dispatches continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload did not decode as the variant this protocol expects.
    Malformed(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "malformed payload: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// A dissemination strategy owned by the broker.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Registration name, also the stats key prefix.
    fn name(&self) -> &'static str;

    /// Track a peer. Idempotent on peer id.
    fn add_peer(&self, peer: &Arc<Peer>);

    /// Forget a peer and anything scheduled for it.
    fn remove_peer(&self, id: &PeerId);

    /// Process one inbound (already decrypted) message.
    async fn handle_incoming(&self, message: &Message) -> Result<(), ProtocolError>;

    /// Point-in-time stats for the aggregated stats surface.
    fn stats(&self) -> serde_json::Value;
}

/// Weak-reference peer set shared by the protocol implementations.
///
/// All accessors copy data out under the lock and release it before any
/// network call happens (no suspension while holding protocol locks).
pub struct PeerRoster {
    peers: Mutex<HashMap<PeerId, Weak<Peer>>>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, peer: &Arc<Peer>) {
        self.peers
            .lock()
            .expect("roster lock poisoned")
            .insert(peer.id().clone(), Arc::downgrade(peer));
    }

    pub fn remove(&self, id: &PeerId) {
        self.peers.lock().expect("roster lock poisoned").remove(id);
    }

    /// Upgradeable peers, with dead entries pruned as a side effect.
    pub fn alive(&self) -> Vec<Arc<Peer>> {
        let mut peers = self.peers.lock().expect("roster lock poisoned");
        let mut alive = Vec::with_capacity(peers.len());
        peers.retain(|_, weak| match weak.upgrade() {
            Some(peer) => {
                alive.push(peer);
                true
            }
            None => false,
        });
        alive
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers
            .lock()
            .expect("roster lock poisoned")
            .get(id)
            .and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().expect("roster lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PeerRoster {
    fn default() -> Self {
        Self::new()
    }
}
