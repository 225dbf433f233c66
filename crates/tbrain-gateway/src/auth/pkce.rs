//! PKCE (Proof Key for Code Exchange) pair generation and verification.
//!
//! Implements S256 code challenges per RFC 7636.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// The only challenge method the gateway accepts.
pub const METHOD_S256: &str = "S256";

/// A generated verifier/challenge pair.
#[derive(Debug, Clone)]
pub struct PkcePair {
    /// High-entropy secret held by the client.
    pub verifier: String,

    /// `BASE64URL(SHA256(verifier))`, sent with the authorization request.
    pub challenge: String,

    /// Challenge method, always `S256`.
    pub method: &'static str,
}

/// Generate a fresh PKCE pair from 32 random bytes.
#[must_use]
pub fn generate() -> PkcePair {
    let verifier = URL_SAFE_NO_PAD.encode(super::random_bytes());
    let challenge = challenge_for(&verifier);
    PkcePair { verifier, challenge, method: METHOD_S256 }
}

/// Verify an S256 code challenge.
///
/// Recomputes `BASE64URL(SHA256(code_verifier))` and compares it to the
/// stored challenge. Stateless; the encoding is byte-exact with [`generate`]
/// (no padding characters).
#[must_use]
pub fn validate(code_verifier: &str, code_challenge: &str) -> bool {
    challenge_for(code_verifier) == code_challenge
}

fn challenge_for(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}
