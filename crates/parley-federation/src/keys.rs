//! Dialback key derivation.
//!
//! A dialback key proves that whoever sent it holds this server's secret. The
//! key is never stored: both the Originating Server (when offering) and the
//! Authoritative Server (when verifying) recompute it from the stream
//! identifier the Receiving Server handed out.
//!
//! # Construction
//! Modelled on XEP-0185:
//!
//! ```text
//! key = HEX( HMAC-SHA256( HEX( SHA256(secret) ), stream_id ) )
//! ```
//!
//! The raw secret is never used as MAC key material directly.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

// ─── Secret ──────────────────────────────────────────────────────────────────

/// The server-local secret all dialback keys derive from.
///
/// Only the process holding this value can act as Authoritative Server for
/// its own domains.
#[derive(Clone)]
pub struct DialbackSecret {
    hashed: String,
}

impl DialbackSecret {
    /// Wrap a configured secret.
    pub fn new(secret: &str) -> Self {
        Self { hashed: hex::encode(Sha256::digest(secret.as_bytes())) }
    }

    /// Generate a random 256-bit secret (used when none is configured).
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self::new(&hex::encode(bytes))
    }

    /// Use `configured` unless it is empty, in which case generate one.
    pub fn from_config(configured: &str) -> Self {
        if configured.is_empty() { Self::generate() } else { Self::new(configured) }
    }

    /// Compute the dialback key for `stream_id`.
    pub fn derive(&self, stream_id: &str) -> String {
        derive_key(stream_id, self)
    }

    /// Constant-time check of a received key against the one we would compute.
    pub fn verify(&self, stream_id: &str, key: &str) -> bool {
        keys_match(&self.derive(stream_id), key)
    }
}

impl fmt::Debug for DialbackSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DialbackSecret(..)")
    }
}

// ─── Derivation ──────────────────────────────────────────────────────────────

/// Derive the dialback key for `stream_id`. Pure and deterministic.
///
/// An empty stream identifier is accepted; the resulting key simply never
/// matches anything a well-behaved peer sends.
pub fn derive_key(stream_id: &str, secret: &DialbackSecret) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.hashed.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(stream_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Compare two keys without leaking the position of the first difference.
pub fn keys_match(expected: &str, received: &str) -> bool {
    expected.trim().as_bytes().ct_eq(received.trim().as_bytes()).into()
}
