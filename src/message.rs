//! # Wire Messages
//!
//! This module defines the message envelope exchanged between peers and the
//! tagged payload variants it carries.
//!
//! ## Envelope
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `id` | UUID assigned once by the originator |
//! | `kind` | chat, health, consensus-proposal, consensus-vote, gossip, control |
//! | `from` / `to` | peer ids; `to` may be the reserved `broadcast` token |
//! | `payload` | tagged variant, encrypted in transit except for health |
//! | `ttl` / `hops` | remaining forward budget / hops taken so far |
//! | `path` | ordered list of peer ids the message has visited |
//!
//! A forward strictly decrements `ttl` and strictly increments `hops`;
//! a message with `ttl <= 0` is never forwarded.
//!
//! ## Wire Format
//!
//! One JSON object per frame. Encrypted payloads appear as the base64 of
//! `nonce || ciphertext || tag`; health frames stay plaintext. Decoding is
//! bounded by [`MAX_FRAME_SIZE`] before the parser runs to prevent memory
//! exhaustion from oversized frames.

use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{now_ms, PeerId};

/// Default forward budget of a freshly created message.
pub const DEFAULT_TTL: i32 = 10;

/// Maximum accepted wire frame size (256 KiB).
/// Frames above this bound are rejected before JSON parsing.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Message priority levels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Kinds of mesh messages. Dissemination protocols dispatch on this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Chat,
    Health,
    ConsensusProposal,
    ConsensusVote,
    Gossip,
    Control,
}

/// Tagged message payload.
///
/// Dispatch happens on the tag, never on runtime type inspection; wire
/// decoding yields an explicit error distinguishable from "absent".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "body", rename_all = "kebab-case")]
pub enum Payload {
    /// Opaque chat bytes.
    ChatBytes(Vec<u8>),
    /// Consensus proposal: a fresh round id and the proposed value bytes.
    Proposal {
        proposal_id: String,
        value: Vec<u8>,
    },
    /// A signed consensus vote.
    VoteEnvelope(VoteEnvelope),
    /// A gossiped record with its round counter.
    GossipRecord(GossipRecord),
    /// Plaintext liveness probe.
    HealthBeacon {
        sent_at_ms: u64,
    },
    /// Control payload (adapter-defined).
    Control(Vec<u8>),
    /// AEAD frame (`nonce || ciphertext || tag`), base64.
    /// Produced by channel encryption; never originated by applications.
    Encrypted(String),
}

impl Payload {
    /// Serialize the payload for channel encryption.
    pub fn to_plain_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Inverse of [`to_plain_bytes`](Self::to_plain_bytes).
    pub fn from_plain_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }

    /// Wrap an AEAD frame for the wire.
    pub fn encrypted(frame: &[u8]) -> Self {
        Payload::Encrypted(base64::engine::general_purpose::STANDARD.encode(frame))
    }

    /// Recover the AEAD frame from an encrypted payload, if it is one.
    pub fn encrypted_frame(&self) -> Option<Result<Vec<u8>, WireError>> {
        match self {
            Payload::Encrypted(data) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .map_err(|e| WireError::Decode(e.to_string())),
            ),
            _ => None,
        }
    }
}

/// A signed vote cast in a consensus round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEnvelope {
    pub proposal_id: String,
    pub voter: PeerId,
    pub value: Vec<u8>,
    pub timestamp_ms: u64,
    /// Ed25519 signature over the vote body with the vote domain prefix.
    pub signature: Vec<u8>,
}

/// A gossiped record: the original message id, the round counter (decimal,
/// strictly monotone per id), first-seen time and the payload bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipRecord {
    pub origin_id: Uuid,
    pub round: u32,
    pub first_seen_ms: u64,
    pub data: Vec<u8>,
}

/// A mesh message. Immutable after creation by the originator; forwarding
/// produces a derived copy via [`forwarded`](Message::forwarded).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub from: PeerId,
    pub to: PeerId,
    pub payload: Payload,
    pub timestamp_ms: u64,
    pub ttl: i32,
    pub hops: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub path: Vec<PeerId>,
}

impl Message {
    pub fn new(kind: MessageKind, from: PeerId, to: PeerId, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            from: from.clone(),
            to,
            payload,
            timestamp_ms: now_ms(),
            ttl: DEFAULT_TTL,
            hops: 0,
            priority: Priority::Normal,
            path: vec![from],
        }
    }

    pub fn chat(from: PeerId, to: PeerId, content: Vec<u8>, priority: Priority) -> Self {
        let mut msg = Self::new(MessageKind::Chat, from, to, Payload::ChatBytes(content));
        msg.priority = priority;
        msg
    }

    pub fn health_probe(from: PeerId, to: PeerId) -> Self {
        Self::new(
            MessageKind::Health,
            from,
            to,
            Payload::HealthBeacon { sent_at_ms: now_ms() },
        )
    }

    /// Whether the forward budget is exhausted.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.ttl <= 0
    }

    /// Derive the copy to hand to the next peer: ttl strictly decreases,
    /// hops strictly increases, and `via` is appended to the path.
    pub fn forwarded(&self, via: &PeerId) -> Self {
        let mut next = self.clone();
        next.ttl -= 1;
        next.hops += 1;
        if !next.path.contains(via) {
            next.path.push(via.clone());
        }
        next
    }

    /// Encode one wire frame.
    pub fn to_wire(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Decode one wire frame, enforcing [`MAX_FRAME_SIZE`] first.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(bytes.len()));
        }
        serde_json::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }
}

/// Error (de)coding wire frames. Protocol-taxonomy: the offending frame is
/// dropped, neighboring dispatches continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    Encode(String),
    Decode(String),
    FrameTooLarge(usize),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Encode(e) => write!(f, "frame encode failed: {e}"),
            WireError::Decode(e) => write!(f, "frame decode failed: {e}"),
            WireError::FrameTooLarge(n) => {
                write!(f, "frame of {n} bytes exceeds limit of {MAX_FRAME_SIZE}")
            }
        }
    }
}

impl std::error::Error for WireError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_message() -> Message {
        Message::chat(
            PeerId::new("node-a"),
            PeerId::new("node-b"),
            b"hello".to_vec(),
            Priority::High,
        )
    }

    #[test]
    fn wire_roundtrip() {
        let msg = chat_message();
        let bytes = msg.to_wire().expect("encode should succeed");
        let decoded = Message::from_wire(&bytes).expect("decode should succeed");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn oversized_frame_rejected_before_parse() {
        let huge = vec![b'{'; MAX_FRAME_SIZE + 1];
        match Message::from_wire(&huge) {
            Err(WireError::FrameTooLarge(n)) => assert_eq!(n, MAX_FRAME_SIZE + 1),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_rejected() {
        assert!(matches!(
            Message::from_wire(b"not json at all"),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn forwarding_decrements_ttl_and_increments_hops() {
        let msg = chat_message();
        let via = PeerId::new("relay");
        let next = msg.forwarded(&via);

        assert_eq!(next.ttl, msg.ttl - 1);
        assert_eq!(next.hops, msg.hops + 1);
        assert!(next.path.contains(&via));
        // Forwarding again through the same peer does not duplicate the path entry.
        let again = next.forwarded(&via);
        assert_eq!(
            again.path.iter().filter(|p| **p == via).count(),
            1
        );
    }

    #[test]
    fn expiry_at_zero_ttl() {
        let mut msg = chat_message();
        assert!(!msg.is_expired());
        msg.ttl = 0;
        assert!(msg.is_expired());
        msg.ttl = -1;
        assert!(msg.is_expired());
    }

    #[test]
    fn kind_serializes_to_kebab_case() {
        let json = serde_json::to_string(&MessageKind::ConsensusProposal)
            .expect("serialize should succeed");
        assert_eq!(json, "\"consensus-proposal\"");
    }

    #[test]
    fn encrypted_payload_roundtrips_base64() {
        let frame = vec![0u8, 1, 2, 3, 255];
        let payload = Payload::encrypted(&frame);
        let recovered = payload
            .encrypted_frame()
            .expect("should be encrypted variant")
            .expect("base64 should decode");
        assert_eq!(recovered, frame);
        assert!(matches!(
            Payload::ChatBytes(vec![]).encrypted_frame(),
            None
        ));
    }

    #[test]
    fn payload_plain_bytes_roundtrip() {
        let payload = Payload::VoteEnvelope(VoteEnvelope {
            proposal_id: "round-1".into(),
            voter: PeerId::new("node-a"),
            value: b"X".to_vec(),
            timestamp_ms: 1,
            signature: vec![0u8; 64],
        });
        let bytes = payload.to_plain_bytes().expect("encode should succeed");
        assert_eq!(
            Payload::from_plain_bytes(&bytes).expect("decode should succeed"),
            payload
        );
    }
}
