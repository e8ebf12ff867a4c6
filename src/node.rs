//! # High-Level Node API
//!
//! A [`MeshNode`] combines the underlying components (broker, dissemination
//! protocols, discovery, storage, polls) into a single unified interface.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = MeshNode::start(Config::default()).await?;
//!
//! // Chat over the mesh
//! node.send_chat(&PeerId::broadcast(), b"hello mesh".to_vec(), Priority::Normal).await?;
//!
//! // Receive delivered messages
//! let mut rx = node.messages().await?;
//! while let Some(msg) = rx.recv().await {
//!     println!("got {:?}", msg.payload);
//! }
//! ```
//!
//! ## Component Integration
//!
//! The node orchestrates:
//! - **Broker**: peer table, channel crypto, health loop, unicast/broadcast
//! - **Flooding / Gossip / Consensus**: registered dissemination protocols
//! - **Discovery**: learns peers and feeds them to the broker
//! - **Storage**: optional JSON persistence in the data directory
//! - **Polls**: application-layer voting

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::config::Config;
use crate::consensus::{ConsensusProtocol, ConsensusResult};
use crate::discovery::{DiscoveryHandle, EmulatedDiscovery};
use crate::flood::FloodingProtocol;
use crate::gossip::GossipProtocol;
use crate::identity::{Keypair, PeerId};
use crate::message::{Message, Priority};
use crate::metrics::NullMetrics;
use crate::peer::Peer;
use crate::storage::Storage;
use crate::transport::{EmulatedNetwork, EmulatedTransport};
use crate::voting::{PollAnalysis, PollRegistry, PollVote, VotingPoll};

/// A receiver that can be taken exactly once.
/// Message delivery should have a single consumer.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

/// Capacity of the application delivery queue.
const DELIVERY_QUEUE: usize = 256;

/// A running mesh node.
pub struct MeshNode {
    id: PeerId,
    config: Config,
    broker: Arc<Broker>,
    flooding: Arc<FloodingProtocol>,
    gossip: Arc<GossipProtocol>,
    consensus: Arc<ConsensusProtocol>,
    polls: Arc<PollRegistry>,
    storage: Arc<Storage>,
    hub: EmulatedNetwork,
    discovery: DiscoveryHandle,
    delivery_rx: TakeOnce<Message>,
    inbound: tokio::task::JoinHandle<()>,
}

impl MeshNode {
    /// Validate the configuration, restore persisted state and bring every
    /// component up.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate().context("configuration rejected")?;

        let storage = Arc::new(Storage::open(config.data_dir.clone())?);
        let bootstrap_key = match config.session_bootstrap_key {
            Some(key) => key,
            None => storage.load_or_create_bootstrap_key()?,
        };

        let id = PeerId::random();
        let keypair = Keypair::generate();
        let broker = Broker::new(
            id.clone(),
            keypair.clone(),
            bootstrap_key,
            &config,
            Arc::new(NullMetrics),
        );

        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE);
        let flooding = Arc::new(FloodingProtocol::new(
            id.clone(),
            config.flooding(),
            delivery_tx.clone(),
        ));
        let gossip = Arc::new(GossipProtocol::new(id.clone(), config.gossip(), delivery_tx));
        let consensus = ConsensusProtocol::new(id.clone(), keypair.clone(), config.consensus());

        broker.add_protocol("flooding", flooding.clone());
        broker.add_protocol("gossip", gossip.clone());
        broker.add_protocol("consensus", consensus.clone());

        // Restore persisted application state (read once at startup).
        let polls = Arc::new(PollRegistry::from_parts(
            storage.load_polls().unwrap_or_default(),
            storage.load_votes().unwrap_or_default(),
        ));

        // Attach to the emulated hub and pump inbound frames into the broker.
        let hub = EmulatedNetwork::new();
        let mut inbox = hub.attach(id.clone());
        let inbound = {
            let broker = broker.clone();
            tokio::spawn(async move {
                while let Some(message) = inbox.recv().await {
                    if let Err(e) = broker.handle_incoming(message).await {
                        debug!(error = %e, "inbound frame dropped");
                    }
                }
            })
        };

        // Discovery feeds new peers into the broker; re-advertisements only
        // refresh last-seen.
        let profile = config.adapter.profile();
        let discovery = {
            let broker_found = broker.clone();
            let broker_seen = broker.clone();
            let hub_for_links = hub.clone();
            EmulatedDiscovery::spawn(
                hub.clone(),
                id.clone(),
                config.advertise_interval,
                Arc::new(move |found| {
                    let transport = Arc::new(EmulatedTransport::new(
                        hub_for_links.clone(),
                        found.id.clone(),
                        profile,
                    ));
                    let peer = Arc::new(Peer::new(found.id.clone(), found.address, transport));
                    if let Some(key) = found.public_key {
                        peer.set_public_key(key);
                    }
                    broker_found.add_peer(peer);
                }),
                Arc::new(move |id| {
                    if let Some(peer) = broker_seen.get_peer(id) {
                        peer.touch();
                    }
                }),
            )
        };

        gossip.start();
        consensus.start();
        broker.start();

        Ok(Self {
            id,
            config,
            broker,
            flooding,
            gossip,
            consensus,
            polls,
            storage,
            hub,
            discovery,
            delivery_rx: tokio::sync::Mutex::new(Some(delivery_rx)),
            inbound,
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn gossip(&self) -> &Arc<GossipProtocol> {
        &self.gossip
    }

    pub fn hub(&self) -> &EmulatedNetwork {
        &self.hub
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Send a chat message. Broadcast destinations disseminate by flooding;
    /// concrete destinations go out as load-balanced unicast. The message
    /// is appended to the persisted log best-effort.
    pub async fn send_chat(
        &self,
        to: &PeerId,
        content: Vec<u8>,
        priority: Priority,
    ) -> Result<Message> {
        let message = Message::chat(self.id.clone(), to.clone(), content, priority);
        if to.is_broadcast() {
            self.flooding.broadcast(&message).await;
        } else {
            self.broker.send(message.clone()).await?;
        }
        if let Err(e) = self.storage.append_message(&message) {
            warn!(error = %e, "failed to persist message");
        }
        Ok(message)
    }

    /// Take the delivery receiver. Yields chat messages the protocols hand
    /// to the application; can only be taken once.
    pub async fn messages(&self) -> Result<mpsc::Receiver<Message>> {
        let mut guard = self.delivery_rx.lock().await;
        guard.take().context("message receiver already taken")
    }

    // ------------------------------------------------------------------
    // Consensus
    // ------------------------------------------------------------------

    pub async fn propose(&self, value: Vec<u8>) -> Result<String> {
        self.consensus.propose(value).await
    }

    pub async fn vote(&self, proposal_id: &str, value: Vec<u8>) -> Result<()> {
        self.consensus.vote(proposal_id, value).await
    }

    pub fn consensus_result(&self, proposal_id: &str) -> Option<ConsensusResult> {
        self.consensus.result(proposal_id)
    }

    // ------------------------------------------------------------------
    // Polls
    // ------------------------------------------------------------------

    pub fn create_poll(
        &self,
        title: &str,
        description: &str,
        options_csv: &str,
    ) -> Result<VotingPoll> {
        let poll = self
            .polls
            .create(title, description, options_csv, self.id.clone())?;
        self.persist_polls();
        Ok(poll)
    }

    pub fn vote_poll(&self, poll_id: &str, option: &str) -> Result<()> {
        self.polls.vote(poll_id, self.id.clone(), option)?;
        self.persist_polls();
        Ok(())
    }

    pub fn list_polls(&self) -> Vec<VotingPoll> {
        self.polls.list()
    }

    pub fn analyze_poll(&self, poll_id: &str) -> Result<PollAnalysis> {
        Ok(self.polls.analyze(poll_id)?)
    }

    fn persist_polls(&self) {
        let (polls, votes): (_, std::collections::HashMap<String, Vec<PollVote>>) =
            self.polls.export();
        if let Err(e) = self.storage.save_polls(&polls) {
            warn!(error = %e, "failed to persist polls");
        }
        if let Err(e) = self.storage.save_votes(&votes) {
            warn!(error = %e, "failed to persist votes");
        }
    }

    // ------------------------------------------------------------------
    // Introspection and shutdown
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> serde_json::Value {
        let mut stats = self.broker.stats().await;
        if let Some(map) = stats.as_object_mut() {
            map.insert(
                "adapter".into(),
                serde_json::json!(self.config.adapter.as_str()),
            );
            map.insert("polls".into(), serde_json::json!(self.polls.list().len()));
        }
        stats
    }

    /// Stop every component in reverse dependency order.
    pub async fn shutdown(&self) {
        self.inbound.abort();
        self.discovery.quit().await;
        self.gossip.stop();
        self.consensus.stop();
        self.broker.shutdown().await;
        self.hub.detach(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            data_dir: Some(dir.path().to_path_buf()),
            session_bootstrap_key: Some([7u8; 32]),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn node_starts_and_stops() {
        let dir = TempDir::new().expect("tempdir");
        let node = MeshNode::start(test_config(&dir)).await.expect("start");
        assert!(node.id().as_str().starts_with("mesh_"));
        assert_eq!(node.broker().peer_count(), 0);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_fatal_at_start() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = test_config(&dir);
        config.gossip_fanout = 0;
        assert!(MeshNode::start(config).await.is_err());
    }

    #[tokio::test]
    async fn polls_survive_restart() {
        let dir = TempDir::new().expect("tempdir");

        let poll_id = {
            let node = MeshNode::start(test_config(&dir)).await.expect("start");
            let poll = node
                .create_poll("Lunch?", "", "pizza,ramen")
                .expect("create");
            node.vote_poll(&poll.id, "ramen").expect("vote");
            node.shutdown().await;
            poll.id
        };

        let node = MeshNode::start(test_config(&dir)).await.expect("restart");
        let analysis = node.analyze_poll(&poll_id).expect("poll restored");
        assert_eq!(analysis.total_votes, 1);
        assert_eq!(analysis.leader.as_deref(), Some("ramen"));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn chat_is_persisted_to_the_log() {
        let dir = TempDir::new().expect("tempdir");
        let node = MeshNode::start(test_config(&dir)).await.expect("start");
        node.send_chat(&PeerId::broadcast(), b"hello".to_vec(), Priority::Normal)
            .await
            .expect("broadcast always succeeds locally");
        let log = node.storage().load_messages().expect("load");
        assert_eq!(log.len(), 1);
        node.shutdown().await;
    }
}
