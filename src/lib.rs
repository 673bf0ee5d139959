//! # Murmur
//!
//! A peer-to-peer gossip node implementing the Brahms random peer sampling
//! algorithm over an authenticated, encrypted UDP transport:
//! - **Byzantine-resistant membership** — min-wise independent samplers keep
//!   a uniform sample of the overlay even when adversarial peers flood the
//!   view with pushes
//! - **Proof-of-work push admission** — unsolicited pushes must answer a
//!   time-bounded, identity-bound hash challenge
//! - **Authenticated packets** — every datagram is RSA-signed and wrapped in
//!   hybrid RSA-OAEP + AES-256-GCM encryption
//! - **TTL-bounded dissemination** — opaque application messages flood to a
//!   random peer subset with per-hop TTL decay and flood limits
//! - **Local TCP API** — applications announce messages, subscribe by data
//!   type, and veto invalid messages before they spread further

pub mod api;
pub mod challenge;
pub mod config;
pub mod gossip;

/// Protocol constants
pub mod constants {
    use std::time::Duration;

    /// Maximum size of a P2P or API packet in bytes (u16 size field)
    pub const MAX_PACKET_SIZE: usize = 65_535;
    /// Byte length of a peer identity (SHA-256 output)
    pub const IDENTITY_SIZE: usize = 32;
    /// RSA modulus size for host keys, in bits
    pub const RSA_KEY_BITS: usize = 4096;
    /// AES key carried in the encrypted packet preamble (AES-256)
    pub const PACKET_KEY_SIZE: usize = 32;
    /// AES-GCM nonce length
    pub const GCM_NONCE_SIZE: usize = 12;
    /// Interval between challenger key rotations
    pub const KEY_ROTATION_INTERVAL: Duration = Duration::from_secs(15);
    /// Number of challenger keys kept valid at any time
    pub const KEY_ROTATION_KEEP: usize = 4;
    /// Default wall-clock length of one gossip round
    pub const ROUND_INTERVAL: Duration = Duration::from_secs(1);
    /// How long to wait for a pong before declaring a sampled peer dead
    pub const PONG_TIMEOUT: Duration = Duration::from_millis(500);
    /// Maximum messages held concurrently from a single source peer
    pub const MESSAGE_FLOOD_LIMIT: usize = 50;
    /// Rounds an expired message is remembered for deduplication before
    /// being evicted from the store
    pub const MESSAGE_GRACE_ROUNDS: i32 = 24;
    /// Local TTL assigned to messages with an infinite (zero) wire TTL
    pub const LOCAL_TTL_INFINITE: i32 = 255;
    /// Validation callbacks older than this are dropped at the next dispatch
    pub const VALIDATION_WINDOW: Duration = Duration::from_secs(10);
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute the SHA-256 hash of a byte slice.
pub fn sha256(data: &[u8]) -> Hash {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the SHA-256 hash of the plain concatenation of several slices.
///
/// The protocol hashes raw concatenations (challenge material, sampler
/// biases); all inputs are fixed-size, so the encoding is unambiguous.
pub fn sha256_concat(parts: &[&[u8]]) -> Hash {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_concat_matches_single_buffer() {
        let a = b"hello ";
        let b = b"world";
        let mut joined = Vec::new();
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        assert_eq!(sha256_concat(&[a, b]), sha256(&joined));
    }

    #[test]
    fn sha256_empty_input() {
        // SHA-256 of the empty string is a fixed well-known value
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
