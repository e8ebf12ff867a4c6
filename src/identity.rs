//! # Identities and Keys
//!
//! This module defines the identity types used throughout meshweave:
//!
//! - [`PeerId`]: stable string identifier of a mesh node
//! - [`Keypair`]: Ed25519 signing keypair backing a node's identity
//!
//! ## Identity Model
//!
//! A node is addressed by its [`PeerId`] and authenticated by its Ed25519
//! public key. The two are carried together in discovery beacons so that
//! remote nodes can verify signed records (votes, advertisements) from the
//! moment a peer is learned.
//!
//! The reserved id `broadcast` never names a concrete peer; it addresses the
//! whole mesh and is rejected wherever a single peer is required.
//!
//! ## Seeded Identities
//!
//! Operators that need a reproducible identity (e.g. a node that must keep
//! its id across reinstalls without persisting key material) can derive the
//! Ed25519 seed from a passphrase via Argon2id. Parameters: t=1, m=64 MiB,
//! p=4, 32-byte output.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use argon2::{Algorithm, Argon2, Params, Version};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Argon2id memory cost for seeded identities (64 MiB, in KiB units).
const SEED_M_COST: u32 = 64 * 1024;

/// Argon2id iteration count for seeded identities.
const SEED_T_COST: u32 = 1;

/// Argon2id parallelism for seeded identities.
const SEED_P_COST: u32 = 4;

/// Returns current wall-clock time as milliseconds since the Unix epoch.
/// Used for timestamps in messages and signed records.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Stable string identifier of a mesh node.
///
/// Ids are unique within a peer table (the table keys on them). The
/// reserved token [`PeerId::BROADCAST`] addresses every peer at once.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Reserved destination token addressing all peers.
    pub const BROADCAST: &'static str = "broadcast";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id in the `mesh_<hex>` form used by generated nodes.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut buf = [0u8; 16];
        OsRng.fill_bytes(&mut buf);
        let digest = blake3::hash(&buf);
        Self(format!("mesh_{}", hex::encode(&digest.as_bytes()[..8])))
    }

    pub fn broadcast() -> Self {
        Self(Self::BROADCAST.to_string())
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == Self::BROADCAST
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ed25519 signing keypair backing a node identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new keypair from the OS entropy source.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Derive a keypair deterministically from a seed phrase.
    ///
    /// The Ed25519 seed is Argon2id(seed, salt) with t=1, m=64 MiB, p=4.
    /// The same (seed, salt) pair always yields the same identity.
    pub fn from_seed_phrase(seed: &[u8], salt: &[u8]) -> Result<Self, SeedError> {
        let params = Params::new(SEED_M_COST, SEED_T_COST, SEED_P_COST, Some(32))
            .map_err(|e| SeedError(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut output = [0u8; 32];
        argon2
            .hash_password_into(seed, salt, &mut output)
            .map_err(|e| SeedError(e.to_string()))?;

        Ok(Self::from_secret_key_bytes(&output))
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Error deriving a seeded identity (bad Argon2 parameters or input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedError(String);

impl fmt::Display for SeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seeded identity derivation failed: {}", self.0)
    }
}

impl std::error::Error for SeedError {}
