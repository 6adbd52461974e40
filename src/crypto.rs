//! # Cryptographic Helpers
//!
//! Small pieces shared by the handshake and the framing layer:
//!
//! - [`SignatureError`]: why a signature failed to verify
//! - [`constant_time_eq`]: comparison that does not leak the position of the
//!   first differing byte
//!
//! Signing itself lives on [`Keypair`](crate::identity::Keypair) and
//! verification on [`Identity`](crate::identity::Identity).

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Constant-Time Comparison
// ============================================================================

/// Compare two byte strings without short-circuiting.
///
/// SECURITY: used when checking a peer's claimed identity during the
/// handshake so response timing does not reveal how many leading bytes
/// matched. Lengths are not secret and are compared directly.
#[inline(never)]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    std::hint::black_box(diff) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_slice_equality() {
        assert!(constant_time_eq(b"", b""));
        assert!(constant_time_eq(&[7u8; 32], &[7u8; 32]));
        assert!(!constant_time_eq(&[7u8; 32], &[8u8; 32]));
        assert!(!constant_time_eq(b"abc", b"abcd"));

        let mut last_differs = [1u8; 32];
        last_differs[31] = 2;
        assert!(!constant_time_eq(&[1u8; 32], &last_differs));
    }

    #[test]
    fn signature_error_messages() {
        assert_eq!(SignatureError::Missing.to_string(), "signature is missing");
        assert_eq!(
            SignatureError::VerificationFailed.to_string(),
            "signature verification failed"
        );
    }
}
