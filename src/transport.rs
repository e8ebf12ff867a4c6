//! # Transport Adapters
//!
//! Concrete [`PeerTransport`] implementations:
//!
//! | Adapter | Medium | Use |
//! |---------|--------|-----|
//! | [`EmulatedTransport`] | in-process hub | tests, local development |
//! | [`UdpTransport`] | unicast UDP datagrams | LAN deployments |
//!
//! The emulated hub ([`EmulatedNetwork`]) routes frames between attached
//! inboxes deterministically. Per-link [`LinkProfile`]s model the radio
//! variants (`wifi_emulated`, `ble`) through latency and frame budgets, and
//! a per-peer down switch lets tests force probe failures.
//!
//! Adapters never interpret payload bytes. Delivery is best-effort: a frame
//! handed to the wire may still be lost; the dissemination protocols own
//! redundancy.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::identity::PeerId;
use crate::message::Message;
use crate::peer::{PeerTransport, TransportError};

/// Inbox capacity of an attached emulated endpoint.
const EMULATED_INBOX_CAPACITY: usize = 256;

/// Which adapter family a node runs. Parsed from configuration / CLI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AdapterKind {
    #[default]
    Emulated,
    WifiEmulated,
    Ble,
}

impl std::str::FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emulated" => Ok(AdapterKind::Emulated),
            "wifi_emulated" => Ok(AdapterKind::WifiEmulated),
            "ble" => Ok(AdapterKind::Ble),
            other => Err(format!("unknown adapter: {other}")),
        }
    }
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Emulated => "emulated",
            AdapterKind::WifiEmulated => "wifi_emulated",
            AdapterKind::Ble => "ble",
        }
    }

    pub fn profile(&self) -> LinkProfile {
        match self {
            AdapterKind::Emulated => LinkProfile::generic(),
            AdapterKind::WifiEmulated => LinkProfile::wifi(),
            AdapterKind::Ble => LinkProfile::ble(),
        }
    }
}

/// Link characteristics of an emulated medium.
#[derive(Clone, Copy, Debug)]
pub struct LinkProfile {
    /// One-way delivery latency.
    pub latency: Duration,
    /// Largest frame the link carries. Oversized frames are a protocol
    /// mismatch, surfaced as fatal.
    pub max_frame: usize,
}

impl LinkProfile {
    pub fn generic() -> Self {
        Self {
            latency: Duration::ZERO,
            max_frame: crate::message::MAX_FRAME_SIZE,
        }
    }

    pub fn wifi() -> Self {
        Self {
            latency: Duration::from_millis(2),
            max_frame: 64 * 1024,
        }
    }

    pub fn ble() -> Self {
        Self {
            latency: Duration::from_millis(10),
            max_frame: 8 * 1024,
        }
    }
}

// ============================================================================
// Emulated Hub
// ============================================================================

struct HubState {
    inboxes: HashMap<PeerId, mpsc::Sender<Message>>,
    down: HashSet<PeerId>,
}

/// In-process message hub shared by a set of emulated endpoints.
///
/// Cloning is cheap; all clones see the same hub.
#[derive(Clone)]
pub struct EmulatedNetwork {
    state: Arc<Mutex<HubState>>,
}

impl EmulatedNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                inboxes: HashMap::new(),
                down: HashSet::new(),
            })),
        }
    }

    /// Attach an endpoint, returning its inbox. A second attach under the
    /// same id replaces the first (the old receiver starves out).
    pub fn attach(&self, id: PeerId) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(EMULATED_INBOX_CAPACITY);
        self.state
            .lock()
            .expect("hub lock poisoned")
            .inboxes
            .insert(id, tx);
        rx
    }

    pub fn detach(&self, id: &PeerId) {
        let mut state = self.state.lock().expect("hub lock poisoned");
        state.inboxes.remove(id);
        state.down.remove(id);
    }

    /// Force a link up or down. A down peer refuses sends and probes with a
    /// transient error until brought back up.
    pub fn set_link_down(&self, id: &PeerId, down: bool) {
        let mut state = self.state.lock().expect("hub lock poisoned");
        if down {
            state.down.insert(id.clone());
        } else {
            state.down.remove(id);
        }
    }

    /// Ids of all currently attached endpoints.
    pub fn endpoints(&self) -> Vec<PeerId> {
        self.state
            .lock()
            .expect("hub lock poisoned")
            .inboxes
            .keys()
            .cloned()
            .collect()
    }

    fn sender_for(&self, id: &PeerId) -> Result<mpsc::Sender<Message>, TransportError> {
        let state = self.state.lock().expect("hub lock poisoned");
        if state.down.contains(id) {
            return Err(TransportError::Transient(format!("link to {id} is down")));
        }
        state
            .inboxes
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::Transient(format!("{id}: connection refused")))
    }

    fn probe(&self, id: &PeerId) -> Result<(), TransportError> {
        self.sender_for(id).map(|_| ())
    }
}

impl Default for EmulatedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Emulated link to one remote endpoint on a shared hub.
pub struct EmulatedTransport {
    network: EmulatedNetwork,
    target: PeerId,
    profile: LinkProfile,
}

impl EmulatedTransport {
    pub fn new(network: EmulatedNetwork, target: PeerId, profile: LinkProfile) -> Self {
        Self {
            network,
            target,
            profile,
        }
    }
}

#[async_trait]
impl PeerTransport for EmulatedTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        // The frame budget models the link MTU; an oversized frame is a
        // protocol mismatch, not a transient condition.
        let frame = message
            .to_wire()
            .map_err(|e| TransportError::Fatal(e.to_string()))?;
        if frame.len() > self.profile.max_frame {
            return Err(TransportError::Fatal(format!(
                "frame of {} bytes exceeds link budget of {}",
                frame.len(),
                self.profile.max_frame
            )));
        }

        let sender = self.network.sender_for(&self.target)?;
        if !self.profile.latency.is_zero() {
            tokio::time::sleep(self.profile.latency).await;
        }
        sender
            .send(message.clone())
            .await
            .map_err(|_| TransportError::Transient(format!("{}: inbox closed", self.target)))
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        if !self.profile.latency.is_zero() {
            tokio::time::sleep(self.profile.latency).await;
        }
        self.network.probe(&self.target)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.network.probe(&self.target)
    }
}

// ============================================================================
// UDP Adapter
// ============================================================================

/// Unicast UDP adapter: one JSON frame per datagram.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl UdpTransport {
    /// Bind the adapter to a shared local socket and a remote address.
    /// An unparseable address is a fatal (non-retryable) configuration.
    pub fn new(socket: Arc<UdpSocket>, target: &str) -> Result<Self, TransportError> {
        let target: SocketAddr = target
            .parse()
            .map_err(|e| TransportError::Fatal(format!("unresolvable address {target}: {e}")))?;
        Ok(Self { socket, target })
    }
}

#[async_trait]
impl PeerTransport for UdpTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let frame = message
            .to_wire()
            .map_err(|e| TransportError::Fatal(e.to_string()))?;
        self.socket
            .send_to(&frame, self.target)
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        // UDP is connectionless; an empty datagram exercises the local
        // socket and the route without a payload.
        self.socket
            .send_to(&[], self.target)
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.health_check().await
    }
}
