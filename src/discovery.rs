//! # Peer Discovery
//!
//! Discovery advertises the local identity on a schedule and learns remote
//! identities from their advertisements. For each previously-unknown
//! identity the `on_peer_found` callback fires exactly once per session;
//! re-advertisements only refresh last-seen, and self-advertisements are
//! dropped by identity comparison.
//!
//! Two variants:
//!
//! - [`EmulatedDiscovery`]: scans the in-process hub's attached endpoints.
//!   Deterministic; used by tests and the emulated adapters.
//! - [`MulticastDiscovery`]: sends and receives signed JSON beacons on a
//!   UDP multicast group. Beacon signatures bind the advertised address to
//!   the sender's Ed25519 identity; unverifiable beacons are dropped.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::crypto::{sign_with_domain, verify_with_domain, BEACON_SIGNATURE_DOMAIN};
use crate::identity::{now_ms, Keypair, PeerId};
use crate::transport::EmulatedNetwork;

/// Default advertisement interval.
pub const DEFAULT_ADVERTISE_INTERVAL: Duration = Duration::from_secs(5);

/// Multicast group and port used by [`MulticastDiscovery`].
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 77, 83, 87);
pub const MULTICAST_PORT: u16 = 5670;

/// Largest accepted beacon datagram.
const MAX_BEACON_SIZE: usize = 4096;

/// A peer learned from an advertisement.
#[derive(Clone, Debug)]
pub struct DiscoveredPeer {
    pub id: PeerId,
    pub address: String,
    pub public_key: Option<[u8; 32]>,
}

/// Invoked once per newly-learned identity per session.
pub type PeerFoundCallback = Arc<dyn Fn(DiscoveredPeer) + Send + Sync>;

/// Invoked on re-advertisements of an already-known identity.
pub type PeerSeenCallback = Arc<dyn Fn(&PeerId) + Send + Sync>;

enum Command {
    Quit,
}

/// Handle to a running discovery task.
pub struct DiscoveryHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl DiscoveryHandle {
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Emulated Discovery
// ============================================================================

/// Discovery over the in-process hub: every attached endpoint is treated as
/// an advertisement of its id.
pub struct EmulatedDiscovery;

impl EmulatedDiscovery {
    pub fn spawn(
        network: EmulatedNetwork,
        local_id: PeerId,
        interval: Duration,
        on_found: PeerFoundCallback,
        on_seen: PeerSeenCallback,
    ) -> DiscoveryHandle {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);

        tokio::spawn(async move {
            let mut known: HashSet<PeerId> = HashSet::new();
            let mut tick = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Command::Quit) | None => {
                            debug!("emulated discovery quitting");
                            break;
                        }
                    },
                    _ = tick.tick() => {
                        for id in network.endpoints() {
                            if id == local_id {
                                continue;
                            }
                            if known.insert(id.clone()) {
                                debug!(peer = %id, "discovered emulated peer");
                                on_found(DiscoveredPeer {
                                    address: format!("emulated://{id}"),
                                    id,
                                    public_key: None,
                                });
                            } else {
                                on_seen(&id);
                            }
                        }
                    }
                }
            }
        });

        DiscoveryHandle { cmd_tx }
    }
}

// ============================================================================
// Multicast Discovery
// ============================================================================

/// Signed advertisement datagram.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Beacon {
    id: PeerId,
    addr: String,
    public_key: [u8; 32],
    timestamp_ms: u64,
    signature: Vec<u8>,
}

impl Beacon {
    fn signed_payload(id: &PeerId, addr: &str, timestamp_ms: u64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(id.as_str().len() + addr.len() + 8);
        payload.extend_from_slice(id.as_str().as_bytes());
        payload.extend_from_slice(addr.as_bytes());
        payload.extend_from_slice(&timestamp_ms.to_be_bytes());
        payload
    }

    fn build(keypair: &Keypair, id: &PeerId, addr: &str) -> Self {
        let timestamp_ms = now_ms();
        let payload = Self::signed_payload(id, addr, timestamp_ms);
        Self {
            id: id.clone(),
            addr: addr.to_string(),
            public_key: keypair.public_key_bytes(),
            timestamp_ms,
            signature: sign_with_domain(keypair, BEACON_SIGNATURE_DOMAIN, &payload),
        }
    }

    fn verify(&self) -> bool {
        let payload = Self::signed_payload(&self.id, &self.addr, self.timestamp_ms);
        verify_with_domain(
            &self.public_key,
            BEACON_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
        .is_ok()
    }
}

/// Discovery over a UDP multicast group.
pub struct MulticastDiscovery;

impl MulticastDiscovery {
    /// Join the multicast group and start the advertise/listen loops.
    ///
    /// `advertised_addr` is the unicast address other peers should dial.
    pub async fn spawn(
        keypair: Keypair,
        local_id: PeerId,
        advertised_addr: String,
        interval: Duration,
        on_found: PeerFoundCallback,
        on_seen: PeerSeenCallback,
    ) -> Result<DiscoveryHandle> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, MULTICAST_PORT))
            .await
            .context("failed to bind multicast discovery socket")?;
        socket
            .join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)
            .context("failed to join multicast group")?;

        let socket = Arc::new(socket);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);

        tokio::spawn(async move {
            let mut known: HashSet<PeerId> = HashSet::new();
            let mut tick = tokio::time::interval(interval);
            let mut buf = vec![0u8; MAX_BEACON_SIZE];
            let group = (MULTICAST_GROUP, MULTICAST_PORT);

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Command::Quit) | None => {
                            debug!("multicast discovery quitting");
                            break;
                        }
                    },
                    _ = tick.tick() => {
                        let beacon = Beacon::build(&keypair, &local_id, &advertised_addr);
                        match serde_json::to_vec(&beacon) {
                            Ok(frame) => {
                                if let Err(e) = socket.send_to(&frame, group).await {
                                    warn!(error = %e, "beacon send failed");
                                }
                            }
                            Err(e) => warn!(error = %e, "beacon encode failed"),
                        }
                    }
                    received = socket.recv_from(&mut buf) => {
                        let (n, _src) = match received {
                            Ok(r) => r,
                            Err(e) => {
                                warn!(error = %e, "beacon receive failed");
                                continue;
                            }
                        };
                        let beacon: Beacon = match serde_json::from_slice(&buf[..n]) {
                            Ok(b) => b,
                            Err(_) => continue,
                        };
                        if beacon.id == local_id {
                            continue;
                        }
                        if !beacon.verify() {
                            warn!(peer = %beacon.id, "dropping beacon with bad signature");
                            continue;
                        }
                        if known.insert(beacon.id.clone()) {
                            debug!(peer = %beacon.id, addr = %beacon.addr, "discovered peer");
                            on_found(DiscoveredPeer {
                                id: beacon.id,
                                address: beacon.addr,
                                public_key: Some(beacon.public_key),
                            });
                        } else {
                            on_seen(&beacon.id);
                        }
                    }
                }
            }
        });

        Ok(DiscoveryHandle { cmd_tx })
    }
}
