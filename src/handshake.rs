//! # Mutual Challenge-Response Handshake
//!
//! Runs on the raw stream before any [`SignedConnection`](crate::conn::SignedConnection)
//! exists. Both sides prove possession of their private key by signing a
//! fresh nonce chosen by the other side.
//!
//! ```text
//! caller                                   callee
//!   │ 1. identity ‖ nonce_c                  │
//!   │ ─────────────────────────────────────► │ validator(identity)?
//!   │ 2. identity ‖ sig(D‖nonce_c) ‖ nonce_s │
//!   │ ◄───────────────────────────────────── │
//!   │ check identity == expected             │
//!   │ verify sig(D ‖ nonce_c)                │
//!   │ 3. sig(D ‖ nonce_s)                    │
//!   │ ─────────────────────────────────────► │ verify sig(D ‖ nonce_s)
//! ```
//!
//! Each message is `[1-byte length N][N bytes]`.
//!
//! ## Signature Domain
//!
//! `D` is [`HANDSHAKE_SIGNATURE_DOMAIN`]. Message sizes match the plain
//! challenge-response layout, but signatures over the bare nonce are
//! rejected: a peer that signs `nonce` instead of `D ‖ nonce` cannot
//! complete a handshake with this crate. The prefix keeps a challenge
//! signature from ever verifying as a frame signature over attacker-chosen
//! bytes.
//!
//! ## Failure Semantics
//!
//! - Any malformed length, identity mismatch or bad signature yields
//!   [`Error::Unverified`], which deliberately carries no detail.
//! - A validator rejection closes the stream without sending message 2 and
//!   surfaces as [`Error::Unauthorized`] on the accepting side only.
//! - I/O failures surface as [`Error::Transport`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::crypto::constant_time_eq;
use crate::error::{Error, Result};
use crate::identity::{
    generate_nonce, Identity, Keypair, IDENTITY_SIZE, NONCE_SIZE, SIGNATURE_SIZE,
};
use crate::validator::ConnectionValidator;

/// Largest payload a handshake message can carry (1-byte length prefix).
pub const MAX_HANDSHAKE_MESSAGE: usize = u8::MAX as usize;

/// Domain separation prefix for handshake challenge signatures.
/// SECURITY: keeps a challenge signature from doubling as a frame signature.
pub const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"peerlink-handshake-v1:";

const HELLO_LEN: usize = IDENTITY_SIZE + NONCE_SIZE;
const CHALLENGE_LEN: usize = IDENTITY_SIZE + SIGNATURE_SIZE + NONCE_SIZE;
const PROOF_LEN: usize = SIGNATURE_SIZE;

// ============================================================================
// Message Codec
// ============================================================================

async fn write_message<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    debug_assert!(payload.len() <= MAX_HANDSHAKE_MESSAGE);
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(payload.len() as u8);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_message<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await? as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

fn sign_challenge(keypair: &Keypair, nonce: &[u8]) -> [u8; SIGNATURE_SIZE] {
    let mut prefixed = Vec::with_capacity(HANDSHAKE_SIGNATURE_DOMAIN.len() + nonce.len());
    prefixed.extend_from_slice(HANDSHAKE_SIGNATURE_DOMAIN);
    prefixed.extend_from_slice(nonce);
    keypair.sign(&prefixed)
}

fn verify_challenge(identity: &Identity, nonce: &[u8], signature: &[u8]) -> bool {
    let mut prefixed = Vec::with_capacity(HANDSHAKE_SIGNATURE_DOMAIN.len() + nonce.len());
    prefixed.extend_from_slice(HANDSHAKE_SIGNATURE_DOMAIN);
    prefixed.extend_from_slice(nonce);
    identity.verify(&prefixed, signature).is_ok()
}

// ============================================================================
// Caller Side
// ============================================================================

/// Run the caller side of the handshake, expecting the callee to be
/// `expected`. On success the remote identity is exactly `expected`.
pub async fn initiate<S>(stream: &mut S, keypair: &Keypair, expected: &Identity) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let our_nonce = generate_nonce();

    let mut hello = Vec::with_capacity(HELLO_LEN);
    hello.extend_from_slice(keypair.identity().as_bytes());
    hello.extend_from_slice(&our_nonce);
    write_message(stream, &hello).await?;

    let challenge = read_message(stream).await?;
    if challenge.len() != CHALLENGE_LEN {
        trace!(len = challenge.len(), "challenge has wrong length");
        return Err(Error::Unverified);
    }
    let (claimed, rest) = challenge.split_at(IDENTITY_SIZE);
    let (signature, their_nonce) = rest.split_at(SIGNATURE_SIZE);

    if !constant_time_eq(claimed, expected.as_bytes()) {
        debug!(expected = %expected.short(), "callee presented an unexpected identity");
        return Err(Error::Unverified);
    }
    if !verify_challenge(expected, &our_nonce, signature) {
        debug!(peer = %expected.short(), "callee signature over our nonce is invalid");
        return Err(Error::Unverified);
    }

    let proof = sign_challenge(keypair, their_nonce);
    write_message(stream, &proof).await?;
    Ok(())
}

// ============================================================================
// Callee Side
// ============================================================================

/// Run the callee side of the handshake and return the caller's verified
/// identity.
pub async fn respond<S, V>(stream: &mut S, keypair: &Keypair, validator: &V) -> Result<Identity>
where
    S: AsyncRead + AsyncWrite + Unpin,
    V: ConnectionValidator + ?Sized,
{
    let hello = read_message(stream).await?;
    if hello.len() != HELLO_LEN {
        trace!(len = hello.len(), "hello has wrong length");
        return Err(Error::Unverified);
    }
    let (claimed, their_nonce) = hello.split_at(IDENTITY_SIZE);
    let claimed = Identity::from_slice(claimed).ok_or(Error::Unverified)?;

    let admitted = match validator.validate(&claimed) {
        Ok(admitted) => admitted,
        Err(e) => {
            debug!(peer = %claimed.short(), error = %e, "validator failed");
            false
        }
    };
    if !admitted {
        debug!(peer = %claimed.short(), "validator rejected claimed identity");
        let _ = stream.shutdown().await;
        return Err(Error::Unauthorized(claimed));
    }

    let our_nonce = generate_nonce();
    let mut challenge = Vec::with_capacity(CHALLENGE_LEN);
    challenge.extend_from_slice(keypair.identity().as_bytes());
    challenge.extend_from_slice(&sign_challenge(keypair, their_nonce));
    challenge.extend_from_slice(&our_nonce);
    write_message(stream, &challenge).await?;

    let proof = read_message(stream).await?;
    if proof.len() != PROOF_LEN || !verify_challenge(&claimed, &our_nonce, &proof) {
        debug!(peer = %claimed.short(), "caller failed to prove its identity");
        return Err(Error::Unverified);
    }

    Ok(claimed)
}
