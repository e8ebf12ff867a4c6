//! # Vote-Round Consensus
//!
//! Propose/vote/tally with a 2/3 supermajority check.
//!
//! ## Round Lifecycle
//!
//! 1. **Propose**: the creator assigns a fresh proposal id, votes its own
//!    value and sends the proposal to every peer.
//! 2. **Vote**: a node that accepts a proposal emits a signed vote to every
//!    peer and records it locally.
//! 3. **Tally**: on every new vote, per-value counts are computed over the
//!    BLAKE3 hash of the value bytes. With `N = peers_known + 1` and `M`
//!    the maximum count, the round is achieved once `M >= ceil(N * 2/3)`.
//! 4. **Timeout**: a round neither achieved nor timed out stays open; past
//!    the timeout it is finalized unresolved (no error — the caller sees
//!    `achieved = false`).
//!
//! An achieved round is immutable: late votes are ignored and the result
//! never changes. Ties break toward the lexicographically smaller hash,
//! which is deterministic but does not by itself cross the threshold.
//!
//! Vote envelopes are Ed25519-signed under the vote domain prefix and pass
//! through an explicit decode step, so "malformed vote" is distinguishable
//! from "no vote". Unverifiable signatures are dropped fail-closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::{sign_with_domain, verify_with_domain, VOTE_SIGNATURE_DOMAIN};
use crate::identity::{now_ms, Keypair, PeerId};
use crate::message::{Message, MessageKind, Payload, VoteEnvelope};
use crate::peer::Peer;
use crate::protocol::{PeerRoster, Protocol, ProtocolError};

/// Default voting window per round.
pub const DEFAULT_CONSENSUS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default retention of finished rounds before the cleanup sweep drops them.
pub const DEFAULT_MAX_ROUND_AGE: Duration = Duration::from_secs(300);

/// Cadence of the timeout/cleanup sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Consensus parameters.
#[derive(Clone, Copy, Debug)]
pub struct ConsensusConfig {
    /// Advisory floor reported in stats; the tally threshold itself is
    /// always the 2/3 supermajority formula.
    pub quorum_size: usize,
    pub timeout: Duration,
    pub max_round_age: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            quorum_size: 3,
            timeout: DEFAULT_CONSENSUS_TIMEOUT,
            max_round_age: DEFAULT_MAX_ROUND_AGE,
        }
    }
}

/// `ceil(n * 2/3)` votes needed for supermajority among `n` participants.
#[inline]
pub fn quorum_threshold(n: usize) -> usize {
    (2 * n).div_ceil(3)
}

/// Outcome of a finalized (or achieved) round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConsensusResult {
    /// Hex BLAKE3 hash of the winning value bytes.
    pub value_hash: String,
    pub vote_count: usize,
    pub total_votes: usize,
    pub achieved: bool,
}

/// One recorded vote inside a round.
#[derive(Clone, Debug)]
struct RecordedVote {
    value: Vec<u8>,
    #[allow(dead_code)]
    timestamp_ms: u64,
    #[allow(dead_code)]
    signature: Vec<u8>,
}

struct VoteRound {
    proposal_value: Vec<u8>,
    votes: HashMap<PeerId, RecordedVote>,
    started: Instant,
    start_ms: u64,
    end_ms: Option<u64>,
    result: Option<ConsensusResult>,
}

impl VoteRound {
    fn open(proposal_value: Vec<u8>) -> Self {
        Self {
            proposal_value,
            votes: HashMap::new(),
            started: Instant::now(),
            start_ms: now_ms(),
            end_ms: None,
            result: None,
        }
    }
}

/// Serializable view of one round.
#[derive(Clone, Debug, Serialize)]
pub struct RoundSnapshot {
    pub proposal_id: String,
    pub votes: usize,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub result: Option<ConsensusResult>,
}

/// Quorum-based consensus over vote rounds.
pub struct ConsensusProtocol {
    node_id: PeerId,
    keypair: Keypair,
    config: ConsensusConfig,
    roster: PeerRoster,
    rounds: Mutex<HashMap<String, VoteRound>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl ConsensusProtocol {
    pub fn new(node_id: PeerId, keypair: Keypair, config: ConsensusConfig) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            keypair,
            config,
            roster: PeerRoster::new(),
            rounds: Mutex::new(HashMap::new()),
            stop_tx: Mutex::new(None),
        })
    }

    /// Start the timeout/cleanup sweep. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.stop_tx.lock().expect("consensus stop lock poisoned");
        if guard.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *guard = Some(stop_tx);

        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!("consensus sweep quitting");
                        break;
                    }
                    _ = tick.tick() => {
                        this.finalize_timed_out();
                        this.cleanup();
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(stop) = self
            .stop_tx
            .lock()
            .expect("consensus stop lock poisoned")
            .take()
        {
            let _ = stop.send(true);
        }
    }

    /// Start a new round: store it, cast our own vote, send the proposal to
    /// every peer. Returns the fresh proposal id.
    pub async fn propose(&self, value: Vec<u8>) -> Result<String> {
        let proposal_id = Uuid::new_v4().to_string();
        {
            let mut rounds = self.rounds.lock().expect("rounds lock poisoned");
            rounds.insert(proposal_id.clone(), VoteRound::open(value.clone()));
        }
        info!(proposal = %proposal_id, "proposed consensus round");

        self.vote(&proposal_id, value.clone())
            .await
            .context("failed to vote for own proposal")?;

        let payload = Payload::Proposal {
            proposal_id: proposal_id.clone(),
            value,
        };
        self.send_to_all(MessageKind::ConsensusProposal, payload).await;
        Ok(proposal_id)
    }

    /// Cast this node's vote in an open round and announce it to every peer.
    pub async fn vote(&self, proposal_id: &str, value: Vec<u8>) -> Result<()> {
        let envelope = self.signed_envelope(proposal_id, value);
        {
            let mut rounds = self.rounds.lock().expect("rounds lock poisoned");
            let round = match rounds.get_mut(proposal_id) {
                Some(round) => round,
                None => bail!("proposal {proposal_id} not found"),
            };
            if round.result.is_some() {
                bail!("round {proposal_id} is already finalized");
            }
            round.votes.insert(
                self.node_id.clone(),
                RecordedVote {
                    value: envelope.value.clone(),
                    timestamp_ms: envelope.timestamp_ms,
                    signature: envelope.signature.clone(),
                },
            );
        }
        self.tally(proposal_id);

        self.send_to_all(
            MessageKind::ConsensusVote,
            Payload::VoteEnvelope(envelope),
        )
        .await;
        Ok(())
    }

    /// Result of a round, if it has been achieved or finalized. Applies the
    /// timeout rule first so an expired round reads as unresolved.
    pub fn result(&self, proposal_id: &str) -> Option<ConsensusResult> {
        self.finalize_timed_out();
        self.rounds
            .lock()
            .expect("rounds lock poisoned")
            .get(proposal_id)
            .and_then(|r| r.result.clone())
    }

    pub fn round_snapshot(&self, proposal_id: &str) -> Option<RoundSnapshot> {
        self.rounds
            .lock()
            .expect("rounds lock poisoned")
            .get(proposal_id)
            .map(|r| RoundSnapshot {
                proposal_id: proposal_id.to_string(),
                votes: r.votes.len(),
                start_ms: r.start_ms,
                end_ms: r.end_ms,
                result: r.result.clone(),
            })
    }

    fn signed_envelope(&self, proposal_id: &str, value: Vec<u8>) -> VoteEnvelope {
        let timestamp_ms = now_ms();
        let payload = vote_signing_payload(proposal_id, &self.node_id, &value, timestamp_ms);
        VoteEnvelope {
            proposal_id: proposal_id.to_string(),
            voter: self.node_id.clone(),
            value,
            timestamp_ms,
            signature: sign_with_domain(&self.keypair, VOTE_SIGNATURE_DOMAIN, &payload),
        }
    }

    async fn send_to_all(&self, kind: MessageKind, payload: Payload) {
        let peers = self.roster.alive();
        for peer in peers {
            let message = Message::new(
                kind,
                self.node_id.clone(),
                peer.id().clone(),
                payload.clone(),
            );
            if let Err(e) = peer.send(&message).await {
                warn!(peer = %peer.id(), kind = ?kind, error = %e, "consensus send failed");
            }
        }
    }

    fn on_proposal(&self, proposal_id: &str, value: &[u8]) {
        let mut rounds = self.rounds.lock().expect("rounds lock poisoned");
        if rounds.contains_key(proposal_id) {
            return;
        }
        rounds.insert(proposal_id.to_string(), VoteRound::open(value.to_vec()));
        info!(proposal = %proposal_id, "received new proposal");
    }

    fn on_vote(&self, envelope: &VoteEnvelope) {
        // Fail-closed signature check when the voter's key is known.
        if let Some(public_key) = self
            .roster
            .get(&envelope.voter)
            .and_then(|p| p.public_key())
        {
            let payload = vote_signing_payload(
                &envelope.proposal_id,
                &envelope.voter,
                &envelope.value,
                envelope.timestamp_ms,
            );
            if verify_with_domain(
                &public_key,
                VOTE_SIGNATURE_DOMAIN,
                &payload,
                &envelope.signature,
            )
            .is_err()
            {
                warn!(
                    proposal = %envelope.proposal_id,
                    voter = %envelope.voter,
                    "dropping vote with bad signature"
                );
                return;
            }
        }

        {
            let mut rounds = self.rounds.lock().expect("rounds lock poisoned");
            // A vote can be the first observation of a proposal id.
            let round = rounds
                .entry(envelope.proposal_id.clone())
                .or_insert_with(|| VoteRound::open(Vec::new()));
            if round.result.as_ref().is_some_and(|r| r.achieved) {
                debug!(proposal = %envelope.proposal_id, "ignoring vote for achieved round");
                return;
            }
            round.votes.insert(
                envelope.voter.clone(),
                RecordedVote {
                    value: envelope.value.clone(),
                    timestamp_ms: envelope.timestamp_ms,
                    signature: envelope.signature.clone(),
                },
            );
        }
        debug!(proposal = %envelope.proposal_id, voter = %envelope.voter, "recorded vote");
        self.tally(&envelope.proposal_id);
    }

    /// Recompute the per-value counts and mark the round achieved when the
    /// supermajority is reached. An already-finalized round never changes.
    fn tally(&self, proposal_id: &str) {
        let mut rounds = self.rounds.lock().expect("rounds lock poisoned");
        let Some(round) = rounds.get_mut(proposal_id) else {
            return;
        };
        if round.result.is_some() {
            return;
        }

        let total_participants = self.roster.len() + 1;
        let Some((leader_hash, leader_count)) = leading_value(&round.votes) else {
            return;
        };

        if leader_count >= quorum_threshold(total_participants) {
            round.result = Some(ConsensusResult {
                value_hash: hex::encode(leader_hash),
                vote_count: leader_count,
                total_votes: round.votes.len(),
                achieved: true,
            });
            round.end_ms = Some(now_ms());
            info!(
                proposal = %proposal_id,
                votes = leader_count,
                participants = total_participants,
                "consensus achieved"
            );
        }
    }

    /// Finalize open rounds past the voting window as unresolved.
    fn finalize_timed_out(&self) {
        let mut rounds = self.rounds.lock().expect("rounds lock poisoned");
        for (proposal_id, round) in rounds.iter_mut() {
            if round.result.is_some() || round.started.elapsed() <= self.config.timeout {
                continue;
            }
            let (leader_hash, leader_count) =
                leading_value(&round.votes).unwrap_or(([0u8; 32], 0));
            round.result = Some(ConsensusResult {
                value_hash: hex::encode(leader_hash),
                vote_count: leader_count,
                total_votes: round.votes.len(),
                achieved: false,
            });
            round.end_ms = Some(now_ms());
            info!(proposal = %proposal_id, votes = round.votes.len(), "round timed out unresolved");
        }
    }

    /// Drop finished rounds older than the configured max age.
    fn cleanup(&self) {
        let max_age_ms = self.config.max_round_age.as_millis() as u64;
        let now = now_ms();
        let mut rounds = self.rounds.lock().expect("rounds lock poisoned");
        rounds.retain(|_, round| match round.end_ms {
            Some(end) => now.saturating_sub(end) <= max_age_ms,
            None => true,
        });
    }
}

/// Highest-count value hash with deterministic tie-breaking: among equal
/// counts the lexicographically smaller hash wins.
fn leading_value(votes: &HashMap<PeerId, RecordedVote>) -> Option<([u8; 32], usize)> {
    let mut counts: HashMap<[u8; 32], usize> = HashMap::new();
    for vote in votes.values() {
        *counts.entry(*blake3::hash(&vote.value).as_bytes()).or_insert(0) += 1;
    }

    counts.into_iter().fold(None, |best, (hash, count)| match best {
        None => Some((hash, count)),
        Some((best_hash, best_count)) => {
            if count > best_count || (count == best_count && hash < best_hash) {
                Some((hash, count))
            } else {
                Some((best_hash, best_count))
            }
        }
    })
}

fn vote_signing_payload(
    proposal_id: &str,
    voter: &PeerId,
    value: &[u8],
    timestamp_ms: u64,
) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(proposal_id.len() + voter.as_str().len() + value.len() + 8);
    payload.extend_from_slice(proposal_id.as_bytes());
    payload.extend_from_slice(voter.as_str().as_bytes());
    payload.extend_from_slice(value);
    payload.extend_from_slice(&timestamp_ms.to_be_bytes());
    payload
}

#[async_trait]
impl Protocol for ConsensusProtocol {
    fn name(&self) -> &'static str {
        "consensus"
    }

    fn add_peer(&self, peer: &Arc<Peer>) {
        self.roster.add(peer);
        debug!(peer = %peer.id(), "added peer to consensus protocol");
    }

    fn remove_peer(&self, id: &PeerId) {
        self.roster.remove(id);
        debug!(peer = %id, "removed peer from consensus protocol");
    }

    async fn handle_incoming(&self, message: &Message) -> Result<(), ProtocolError> {
        match message.kind {
            MessageKind::ConsensusProposal => match &message.payload {
                Payload::Proposal { proposal_id, value } => {
                    self.on_proposal(proposal_id, value);
                    Ok(())
                }
                _ => Err(ProtocolError::Malformed(
                    "consensus-proposal frame without proposal payload".into(),
                )),
            },
            MessageKind::ConsensusVote => match &message.payload {
                Payload::VoteEnvelope(envelope) => {
                    self.on_vote(envelope);
                    Ok(())
                }
                _ => Err(ProtocolError::Malformed(
                    "consensus-vote frame without vote envelope".into(),
                )),
            },
            _ => Ok(()),
        }
    }

    fn stats(&self) -> serde_json::Value {
        let rounds = self.rounds.lock().expect("rounds lock poisoned");
        let achieved = rounds
            .values()
            .filter(|r| r.result.as_ref().is_some_and(|res| res.achieved))
            .count();
        let snapshot = ConsensusStats {
            peers: self.roster.len(),
            active_rounds: rounds.values().filter(|r| r.result.is_none()).count(),
            achieved_rounds: achieved,
            quorum_size: self.config.quorum_size,
            timeout_secs: self.config.timeout.as_secs(),
        };
        serde_json::to_value(snapshot).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct ConsensusStats {
    peers: usize,
    active_rounds: usize,
    achieved_rounds: usize,
    quorum_size: usize,
    timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn consensus_under_test(node: &str, peer_count: usize) -> (Arc<ConsensusProtocol>, EmulatedNetwork) {
        let hub = EmulatedNetwork::new();
        let consensus = ConsensusProtocol::new(
            PeerId::new(node),
            Keypair::generate(),
            ConsensusConfig::default(),
        );
        for i in 0..peer_count {
            let id = format!("peer-{i}");
            let _inbox = hub.attach(PeerId::new(&id));
            consensus.add_peer(&hub_peer(&hub, &id));
        }
        (consensus, hub)
    }

    fn remote_vote(proposal_id: &str, voter: &str, value: &[u8]) -> VoteEnvelope {
        let keypair = Keypair::generate();
        let voter = PeerId::new(voter);
        let timestamp_ms = now_ms();
        let payload = vote_signing_payload(proposal_id, &voter, value, timestamp_ms);
        VoteEnvelope {
            proposal_id: proposal_id.to_string(),
            voter,
            value: value.to_vec(),
            timestamp_ms,
            signature: sign_with_domain(&keypair, VOTE_SIGNATURE_DOMAIN, &payload),
        }
    }

    #[test]
    fn quorum_formula() {
        assert_eq!(quorum_threshold(1), 1);
        assert_eq!(quorum_threshold(3), 2);
        assert_eq!(quorum_threshold(4), 3);
        assert_eq!(quorum_threshold(6), 4);
        assert_eq!(quorum_threshold(7), 5);
    }

    #[tokio::test]
    async fn supermajority_achieves_consensus() {
        // N = 3 peers + self = 4, quorum = 3.
        let (consensus, _hub) = consensus_under_test("me", 3);
        let proposal_id = consensus.propose(b"X".to_vec()).await.expect("propose");

        consensus.on_vote(&remote_vote(&proposal_id, "peer-0", b"X"));
        assert!(consensus.result(&proposal_id).is_none(), "2 of 4 is below quorum");

        consensus.on_vote(&remote_vote(&proposal_id, "peer-1", b"X"));
        let result = consensus.result(&proposal_id).expect("achieved at 3 of 4");
        assert!(result.achieved);
        assert_eq!(result.vote_count, 3);
        assert_eq!(result.value_hash, hex::encode(blake3::hash(b"X").as_bytes()));
    }

    #[tokio::test]
    async fn achieved_round_is_immutable() {
        let (consensus, _hub) = consensus_under_test("me", 2);
        let proposal_id = consensus.propose(b"X".to_vec()).await.expect("propose");
        consensus.on_vote(&remote_vote(&proposal_id, "peer-0", b"X"));
        let first = consensus.result(&proposal_id).expect("achieved");
        assert!(first.achieved);

        // Late dissenting votes change nothing.
        consensus.on_vote(&remote_vote(&proposal_id, "peer-1", b"Y"));
        consensus.on_vote(&remote_vote(&proposal_id, "late-peer", b"Y"));
        assert_eq!(consensus.result(&proposal_id).expect("still set"), first);
    }

    #[tokio::test]
    async fn split_vote_times_out_unresolved() {
        let hub = EmulatedNetwork::new();
        let consensus = ConsensusProtocol::new(
            PeerId::new("me"),
            Keypair::generate(),
            ConsensusConfig {
                timeout: Duration::from_millis(20),
                ..ConsensusConfig::default()
            },
        );
        for id in ["peer-0", "peer-1", "peer-2"] {
            let _inbox = hub.attach(PeerId::new(id));
            consensus.add_peer(&hub_peer(&hub, id));
        }

        // 2 x "X" (self + peer-0) vs 2 x "Y": below quorum of 3.
        let proposal_id = consensus.propose(b"X".to_vec()).await.expect("propose");
        consensus.on_vote(&remote_vote(&proposal_id, "peer-0", b"X"));
        consensus.on_vote(&remote_vote(&proposal_id, "peer-1", b"Y"));
        consensus.on_vote(&remote_vote(&proposal_id, "peer-2", b"Y"));
        assert!(consensus.result(&proposal_id).is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let result = consensus.result(&proposal_id).expect("finalized by timeout");
        assert!(!result.achieved);
        assert_eq!(result.total_votes, 4);
    }

    #[tokio::test]
    async fn tie_breaks_toward_smaller_hash() {
        let hub = EmulatedNetwork::new();
        let consensus = ConsensusProtocol::new(
            PeerId::new("me"),
            Keypair::generate(),
            ConsensusConfig {
                timeout: Duration::from_millis(10),
                ..ConsensusConfig::default()
            },
        );
        for id in ["peer-0", "peer-1", "peer-2"] {
            let _inbox = hub.attach(PeerId::new(id));
            consensus.add_peer(&hub_peer(&hub, id));
        }

        let proposal_id = consensus.propose(b"X".to_vec()).await.expect("propose");
        consensus.on_vote(&remote_vote(&proposal_id, "peer-0", b"X"));
        consensus.on_vote(&remote_vote(&proposal_id, "peer-1", b"Y"));
        consensus.on_vote(&remote_vote(&proposal_id, "peer-2", b"Y"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = consensus.result(&proposal_id).expect("finalized");
        let hash_x = *blake3::hash(b"X").as_bytes();
        let hash_y = *blake3::hash(b"Y").as_bytes();
        let expected = if hash_x < hash_y { hash_x } else { hash_y };
        assert_eq!(result.value_hash, hex::encode(expected));
        assert!(!result.achieved, "a tie never crosses the threshold by itself");
    }

    #[tokio::test]
    async fn proposal_broadcast_reaches_every_peer() {
        let hub = EmulatedNetwork::new();
        let consensus = ConsensusProtocol::new(
            PeerId::new("me"),
            Keypair::generate(),
            ConsensusConfig::default(),
        );
        let mut inboxes = Vec::new();
        for id in ["peer-0", "peer-1"] {
            inboxes.push(hub.attach(PeerId::new(id)));
            consensus.add_peer(&hub_peer(&hub, id));
        }

        let proposal_id = consensus.propose(b"X".to_vec()).await.expect("propose");

        for inbox in &mut inboxes {
            let mut kinds = Vec::new();
            while let Ok(msg) = inbox.try_recv() {
                if let Payload::Proposal { proposal_id: pid, .. } = &msg.payload {
                    assert_eq!(pid, &proposal_id);
                }
                kinds.push(msg.kind);
            }
            assert!(kinds.contains(&MessageKind::ConsensusProposal));
            assert!(kinds.contains(&MessageKind::ConsensusVote), "own vote announced");
        }
    }

    #[tokio::test]
    async fn forged_vote_from_known_peer_is_dropped() {
        let hub = EmulatedNetwork::new();
        let consensus = ConsensusProtocol::new(
            PeerId::new("me"),
            Keypair::generate(),
            ConsensusConfig::default(),
        );

        // peer-0's record carries its real public key.
        let honest = Keypair::generate();
        let _inbox = hub.attach(PeerId::new("peer-0"));
        let peer = hub_peer(&hub, "peer-0");
        peer.set_public_key(honest.public_key_bytes());
        consensus.add_peer(&peer);

        let proposal_id = consensus.propose(b"X".to_vec()).await.expect("propose");

        // Vote claims peer-0 but is signed by another key.
        let forged = remote_vote(&proposal_id, "peer-0", b"X");
        consensus.on_vote(&forged);
        let snapshot = consensus.round_snapshot(&proposal_id).expect("round exists");
        assert_eq!(snapshot.votes, 1, "only our own vote is recorded");

        // A properly signed vote from peer-0 is accepted. N = 2, quorum = 2.
        let timestamp_ms = now_ms();
        let payload = vote_signing_payload(&proposal_id, &PeerId::new("peer-0"), b"X", timestamp_ms);
        consensus.on_vote(&VoteEnvelope {
            proposal_id: proposal_id.clone(),
            voter: PeerId::new("peer-0"),
            value: b"X".to_vec(),
            timestamp_ms,
            signature: sign_with_domain(&honest, VOTE_SIGNATURE_DOMAIN, &payload),
        });
        assert!(consensus.result(&proposal_id).expect("achieved").achieved);
    }

    #[tokio::test]
    async fn vote_on_unknown_proposal_opens_the_round() {
        let (consensus, _hub) = consensus_under_test("me", 1);
        let envelope = remote_vote("orphan-round", "peer-0", b"X");
        consensus.on_vote(&envelope);
        assert!(consensus.round_snapshot("orphan-round").is_some());
    }

    #[tokio::test]
    async fn cleanup_drops_old_finished_rounds() {
        let (consensus, _hub) = consensus_under_test("me", 0);
        // Single participant: proposing immediately achieves quorum (1 of 1).
        let proposal_id = consensus.propose(b"X".to_vec()).await.expect("propose");
        assert!(consensus.result(&proposal_id).expect("achieved").achieved);

        // Force the finished round past the retention horizon.
        {
            let mut rounds = consensus.rounds.lock().expect("rounds lock poisoned");
            rounds.get_mut(&proposal_id).expect("round exists").end_ms =
                Some(now_ms().saturating_sub(400_000));
        }
        consensus.cleanup();
        assert!(consensus.round_snapshot(&proposal_id).is_none());
    }

    #[tokio::test]
    async fn malformed_consensus_payload_is_an_error() {
        let (consensus, _hub) = consensus_under_test("me", 0);
        let mut bogus = Message::new(
            MessageKind::ConsensusVote,
            PeerId::new("remote"),
            PeerId::new("me"),
            Payload::ChatBytes(b"not a vote".to_vec()),
        );
        assert!(matches!(
            consensus.handle_incoming(&bogus).await,
            Err(ProtocolError::Malformed(_))
        ));

        bogus.kind = MessageKind::ConsensusProposal;
        assert!(matches!(
            consensus.handle_incoming(&bogus).await,
            Err(ProtocolError::Malformed(_))
        ));
    }
}
