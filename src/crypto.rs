//! # Cryptographic Infrastructure
//!
//! This module provides the cryptographic primitives for meshweave:
//!
//! - **Signatures**: domain-separated Ed25519 signing and verification
//! - **Session keys**: X25519 ECDH + HKDF-SHA256 key derivation
//! - **Record protection**: ChaCha20-Poly1305 (default) or AES-256-GCM AEAD
//!
//! ## Frame Format
//!
//! An encrypted payload is `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! The nonce is freshly random per frame. Optional AAD binds the enclosing
//! message id and sender id so a ciphertext cannot be replayed under a
//! different envelope.
//!
//! ## Session Establishment
//!
//! Each side generates an ephemeral X25519 keypair and exchanges the public
//! halves. The shared secret is fed through HKDF-SHA256 with a random
//! 32-byte salt and the info label `mesh-session-key`, yielding a 32-byte
//! AEAD key. Both directions derive the same key from either side's secret.
//!
//! ## Fail-Closed Policy
//!
//! Decrypt and signature failures are terminal for the affected frame: the
//! caller drops the message, logs it, and never retries.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key as ChaChaKey, Nonce};
use aes_gcm::Aes256Gcm;
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::identity::{Keypair, PeerId};

// ============================================================================
// Error Types
// ============================================================================

/// Error type for cryptographic failures.
///
/// All variants are fail-closed: the affected frame is dropped and never
/// retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length (expected 32 bytes).
    InvalidKeyLength,
    /// Encryption failed.
    EncryptFailed,
    /// Ciphertext failed authentication or is malformed.
    DecryptFailed,
    /// Frame too short to contain a nonce.
    FrameTooShort,
    /// Signature is missing (empty).
    SignatureMissing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    SignatureInvalidLength,
    /// Cryptographic signature verification failed.
    SignatureInvalid,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::InvalidKeyLength => write!(f, "key has invalid length"),
            CryptoError::EncryptFailed => write!(f, "encryption failed"),
            CryptoError::DecryptFailed => write!(f, "decryption failed"),
            CryptoError::FrameTooShort => write!(f, "frame too short to contain nonce"),
            CryptoError::SignatureMissing => write!(f, "signature is missing"),
            CryptoError::SignatureInvalidLength => write!(f, "signature has invalid length"),
            CryptoError::SignatureInvalid => write!(f, "signature verification failed"),
            CryptoError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// Each signed record type uses a unique prefix so a signature can never be
// replayed in a different context.

/// Domain separation prefix for consensus vote envelopes.
pub const VOTE_SIGNATURE_DOMAIN: &[u8] = b"meshweave-vote-v1:";

/// Domain separation prefix for discovery beacons.
pub const BEACON_SIGNATURE_DOMAIN: &[u8] = b"meshweave-beacon-v1:";

/// HKDF info label for session key derivation.
pub const SESSION_KEY_INFO: &[u8] = b"mesh-session-key";

/// Nonce length of both supported AEAD suites.
pub const NONCE_LEN: usize = 12;

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with a domain prefix.
///
/// Returns the 64-byte Ed25519 signature as a `Vec<u8>`.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-prefixed signature against a claimed public key.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    if signature.is_empty() {
        return Err(CryptoError::SignatureMissing);
    }
    if signature.len() != 64 {
        return Err(CryptoError::SignatureInvalidLength);
    }

    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|_| CryptoError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::SignatureInvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| CryptoError::SignatureInvalid)
}

// ============================================================================
// AEAD Channel Cipher
// ============================================================================

/// Which AEAD suite protects channel frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AeadSuite {
    /// ChaCha20-Poly1305 (preferred).
    #[default]
    ChaCha20Poly1305,
    /// AES-256-GCM.
    Aes256Gcm,
}

/// Symmetric cipher over a 32-byte key, producing self-contained frames
/// (`nonce || ciphertext || tag`).
#[derive(Clone)]
pub struct ChannelCipher {
    key: [u8; 32],
    suite: AeadSuite,
}

impl ChannelCipher {
    pub fn new(key: [u8; 32], suite: AeadSuite) -> Self {
        Self { key, suite }
    }

    pub fn from_key_bytes(bytes: &[u8], suite: AeadSuite) -> Result<Self, CryptoError> {
        let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self::new(key, suite))
    }

    pub fn suite(&self) -> AeadSuite {
        self.suite
    }

    /// Encrypt a plaintext into a self-contained frame with a fresh nonce.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let payload = Payload { msg: plaintext, aad };

        let ciphertext = match self.suite {
            AeadSuite::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(&self.key));
                cipher.encrypt(nonce, payload)
            }
            AeadSuite::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&self.key)
                    .map_err(|_| CryptoError::InvalidKeyLength)?;
                cipher.encrypt(nonce, payload)
            }
        }
        .map_err(|_| CryptoError::EncryptFailed)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Decrypt a self-contained frame produced by [`seal`](Self::seal).
    pub fn open(&self, frame: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < NONCE_LEN {
            return Err(CryptoError::FrameTooShort);
        }
        let (nonce_bytes, ciphertext) = frame.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let payload = Payload { msg: ciphertext, aad };

        match self.suite {
            AeadSuite::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(&self.key));
                cipher.decrypt(nonce, payload)
            }
            AeadSuite::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&self.key)
                    .map_err(|_| CryptoError::InvalidKeyLength)?;
                cipher.decrypt(nonce, payload)
            }
        }
        .map_err(|_| CryptoError::DecryptFailed)
    }
}

impl std::fmt::Debug for ChannelCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCipher")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

/// AAD binding an encrypted payload to its envelope (message id + sender).
pub fn message_aad(message_id: &uuid::Uuid, from: &PeerId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + from.as_str().len());
    aad.extend_from_slice(message_id.as_bytes());
    aad.extend_from_slice(from.as_str().as_bytes());
    aad
}

// ============================================================================
// Session Handshake (X25519 + HKDF)
// ============================================================================

/// A 32-byte per-peer AEAD session key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionKey(pub [u8; 32]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// One side of an ephemeral X25519 key agreement.
///
/// The secret half never leaves this struct; [`derive`](Self::derive)
/// consumes the peer's public half and the shared salt, producing the
/// session key.
pub struct SessionHandshake {
    secret: StaticSecret,
    public: X25519Public,
}

impl SessionHandshake {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// The public half to send to the peer.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Complete the agreement: ECDH with the peer's public half, then
    /// HKDF-SHA256 over the shared secret with the given salt and the
    /// `mesh-session-key` info label.
    pub fn derive(&self, peer_public: &[u8; 32], salt: &[u8]) -> SessionKey {
        let peer = X25519Public::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);

        let hkdf = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
        let mut key = [0u8; 32];
        hkdf.expand(SESSION_KEY_INFO, &mut key)
            .expect("HKDF expand never fails for 32-byte output");
        SessionKey(key)
    }
}

/// A fresh random 32-byte handshake salt.
pub fn random_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}
