//! # Identity and Key Material
//!
//! This module defines the identity types every other layer builds on:
//!
//! - [`Keypair`]: Ed25519 signing keypair held by the local node
//! - [`Identity`]: 32-byte public key identifying a peer (the "token")
//! - [`Nonce`]: fresh random challenge used by the handshake
//! - [`ContentHash`]: BLAKE3 digest used for gossip deduplication
//!
//! ## Identity Model
//!
//! A peer *is* its public key. There is no certificate or registry layer:
//! a peer proves its identity by signing challenges with the matching
//! private key, and every frame it sends afterwards carries a signature
//! that can be checked against the same 32 bytes.
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(b).as_bytes() == &b`
//! - `Identity::from_str(&id.to_string()) == Ok(id)`
//! - A [`Keypair`] always signs with the key behind its own [`Identity`]

use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::crypto::SignatureError;

/// Size of an identity (Ed25519 public key) in bytes.
pub const IDENTITY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a handshake nonce in bytes.
pub const NONCE_SIZE: usize = 32;

/// Size of a content hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Random challenge bytes.
pub type Nonce = [u8; NONCE_SIZE];

/// BLAKE3 digest of a message body.
pub type ContentHash = [u8; HASH_SIZE];

/// Draw a fresh nonce from the OS CSPRNG.
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Hash message content for deduplication.
#[inline]
pub fn content_hash(data: &[u8]) -> ContentHash {
    *blake3::hash(data).as_bytes()
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Parse a 64-character hex secret key.
    pub fn from_secret_key_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim())?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self::from_secret_key_bytes(&arr))
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity([u8; IDENTITY_SIZE]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; IDENTITY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build an identity from a slice, failing unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; IDENTITY_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; IDENTITY_SIZE] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Check that the identity is a usable Ed25519 public key.
    ///
    /// All-zero and all-0xFF values are rejected up front; everything else
    /// must decode as a curve point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }

    /// Verify `signature` over `message` against this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        let sig_bytes: [u8; SIGNATURE_SIZE] = signature
            .try_into()
            .map_err(|_| SignatureError::InvalidLength)?;
        let verifying_key = VerifyingKey::try_from(self.0.as_slice())
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        verifying_key
            .verify(message, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SignatureError::VerificationFailed)
    }

    /// Short prefix used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Identity {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s.trim())
    }
}

impl From<[u8; IDENTITY_SIZE]> for Identity {
    fn from(bytes: [u8; IDENTITY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; IDENTITY_SIZE] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_identity_matches_public_key() {
        let keypair = Keypair::generate();
        assert_eq!(keypair.identity().as_bytes(), &keypair.public_key_bytes());
        assert!(keypair.identity().is_valid());
    }

    #[test]
    fn secret_key_roundtrip_preserves_identity() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(keypair.identity(), restored.identity());

        let from_hex = Keypair::from_secret_key_hex(&hex::encode(keypair.secret_key_bytes()))
            .expect("valid hex secret");
        assert_eq!(keypair.identity(), from_hex.identity());
    }

    #[test]
    fn identity_parses_from_display() {
        let identity = Keypair::generate().identity();
        let parsed: Identity = identity.to_string().parse().expect("parse identity");
        assert_eq!(parsed, identity);
    }

    #[test]
    fn identity_rejects_wrong_length_hex() {
        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_slice(&[1u8; 31]).is_none());
    }

    #[test]
    fn trivial_identities_are_invalid() {
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xFF; 32]).is_valid());
    }

    #[test]
    fn signatures_verify_only_for_signer() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let sig = alice.sign(b"hello");

        assert!(alice.identity().verify(b"hello", &sig).is_ok());
        assert_eq!(
            bob.identity().verify(b"hello", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            alice.identity().verify(b"hello", &sig[..10]),
            Err(SignatureError::InvalidLength)
        );
        assert_eq!(alice.identity().verify(b"hello", &[]), Err(SignatureError::Missing));
    }

    #[test]
    fn nonces_are_fresh() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
    }
}
