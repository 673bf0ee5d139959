//! Stateless, time-bounded proof-of-work challenges bound to peer identities.
//!
//! A [`Challenger`] keeps a short rotation of secret keys. A challenge for a
//! peer is `SHA-256(key_newest || identity)`; because the challenge can be
//! recomputed from any key still in rotation, no per-challenge state is kept.
//! A peer solves a challenge by finding a nonce such that
//! `SHA-256(challenge || nonce)` has at least `difficulty` leading zero bits.
//! Rotation bounds the window in which a solved challenge stays valid, which
//! makes stockpiling solutions useless to an attacker.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::RngCore;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// Byte length of a challenge (SHA-256 output).
pub const CHALLENGE_SIZE: usize = 32;
/// Byte length of a solution nonce (big-endian u64).
pub const NONCE_SIZE: usize = 8;
/// Byte length of one rotation key.
const ROTATION_KEY_SIZE: usize = 64;

/// Errors from challenge generation, verification, and solving.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChallengeError {
    #[error("difficulty {0} is not valid for the utilized hash function")]
    InvalidDifficulty(u32),
    #[error("challenge solve cancelled before a nonce was found")]
    Cancelled,
}

/// Count leading zero bits of a byte slice. An empty slice has zero.
pub fn leading_zero_bits(data: &[u8]) -> u32 {
    let mut zeros = 0;
    for byte in data {
        let lz = byte.leading_zeros();
        zeros += lz;
        if lz != 8 {
            break;
        }
    }
    zeros
}

/// Generator and verifier of identity-bound proof-of-work challenges.
///
/// Clones share the same key rotation. The rotation task appends a fresh key
/// every interval and drops the oldest once the configured count is reached,
/// so challenges issued within the last `keep * interval` stay verifiable.
#[derive(Clone)]
pub struct Challenger {
    keys: Arc<RwLock<Vec<Zeroizing<[u8; ROTATION_KEY_SIZE]>>>>,
}

impl Challenger {
    /// Create a challenger and spawn its key-rotation task.
    ///
    /// `interval` is the rotation period, `keep` the number of keys that stay
    /// valid. The task runs until `shutdown` fires.
    pub fn new(interval: Duration, keep: usize, shutdown: CancellationToken) -> Self {
        let challenger = Challenger {
            keys: Arc::new(RwLock::new(vec![random_key()])),
        };

        let keys = Arc::clone(&challenger.keys);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick fires immediately; skip it so the initial key
            // lives a full interval
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let new_key = random_key();
                        let mut keys = keys.write().expect("challenger key lock poisoned");
                        if keys.len() >= keep {
                            keys.remove(0);
                        }
                        keys.push(new_key);
                    }
                }
            }
        });

        challenger
    }

    /// Build a challenger from fixed keys, newest last. Test seam.
    #[cfg(test)]
    fn with_keys(raw_keys: Vec<[u8; ROTATION_KEY_SIZE]>) -> Self {
        Challenger {
            keys: Arc::new(RwLock::new(raw_keys.into_iter().map(Zeroizing::new).collect())),
        }
    }

    /// Generate a challenge for the given peer identity from the newest key.
    pub fn new_challenge(&self, identity: &[u8]) -> [u8; CHALLENGE_SIZE] {
        let keys = self.keys.read().expect("challenger key lock poisoned");
        let newest = keys.last().expect("challenger key rotation is never empty");
        crate::sha256_concat(&[&newest[..], identity])
    }

    /// Check a solved challenge.
    ///
    /// The solution hash must clear `difficulty` leading zero bits, and the
    /// challenge must be reproducible from a key still in rotation together
    /// with the claimed identity. Keys are scanned newest to oldest.
    pub fn is_solved_correctly(
        &self,
        challenge: &[u8],
        nonce: &[u8],
        identity: &[u8],
        difficulty: u32,
    ) -> Result<bool, ChallengeError> {
        let check_hash = crate::sha256_concat(&[challenge, nonce]);
        if difficulty as usize >= check_hash.len() * 8 {
            return Err(ChallengeError::InvalidDifficulty(difficulty));
        }

        if leading_zero_bits(&check_hash) < difficulty {
            return Ok(false);
        }

        let keys = self.keys.read().expect("challenger key lock poisoned");
        let valid = keys
            .iter()
            .rev()
            .any(|key| crate::sha256_concat(&[&key[..], identity]).as_slice() == challenge);
        Ok(valid)
    }
}

fn random_key() -> Zeroizing<[u8; ROTATION_KEY_SIZE]> {
    let mut key = [0u8; ROTATION_KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    Zeroizing::new(key)
}

/// Search for a nonce whose hash with the challenge clears `difficulty`
/// leading zero bits.
///
/// Nonces count up from zero as big-endian u64. The loop checks `cancel`
/// every iteration so a hostile difficulty cannot pin the caller; run it on a
/// blocking thread (see [`solve_with_deadline`]).
pub fn solve_challenge(
    challenge: &[u8],
    difficulty: u32,
    cancel: &CancellationToken,
) -> Result<[u8; NONCE_SIZE], ChallengeError> {
    for nonce in 0u64.. {
        if cancel.is_cancelled() {
            return Err(ChallengeError::Cancelled);
        }
        let nonce_bytes = nonce.to_be_bytes();
        if leading_zero_bits(&crate::sha256_concat(&[challenge, &nonce_bytes])) >= difficulty {
            return Ok(nonce_bytes);
        }
    }
    // the u64 nonce space is never exhausted before cancellation in practice
    Err(ChallengeError::Cancelled)
}

/// Solve a challenge on a blocking thread, giving up after `deadline`.
pub async fn solve_with_deadline(
    challenge: Vec<u8>,
    difficulty: u32,
    deadline: Duration,
) -> Result<[u8; NONCE_SIZE], ChallengeError> {
    let cancel = CancellationToken::new();
    let solver_cancel = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || {
        solve_challenge(&challenge, difficulty, &solver_cancel)
    });

    tokio::select! {
        res = &mut handle => res.unwrap_or(Err(ChallengeError::Cancelled)),
        _ = tokio::time::sleep(deadline) => {
            cancel.cancel();
            handle.await.unwrap_or(Err(ChallengeError::Cancelled))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_KEY: [u8; ROTATION_KEY_SIZE] = [0x12; ROTATION_KEY_SIZE];
    const EXAMPLE_IDENTITY: &[u8] = b"10.0.0.0";

    #[test]
    fn leading_zero_bits_table() {
        assert_eq!(leading_zero_bits(&[0b0000_0000, 0b0001_1110]), 11);
        assert_eq!(leading_zero_bits(&[0b1000_0000, 0b0001_1110]), 0);
        assert_eq!(
            leading_zero_bits(&[0b0000_0001, 0b0001_1110, 0b0001_1110, 0b0000_0000]),
            7
        );
        assert_eq!(leading_zero_bits(&[]), 0);
        assert_eq!(leading_zero_bits(&[0, 0, 0]), 24);
    }

    #[test]
    fn challenge_is_created_from_newest_key() {
        let challenger = Challenger::with_keys(vec![EXAMPLE_KEY]);
        let challenge = challenger.new_challenge(EXAMPLE_IDENTITY);
        assert_eq!(
            hex::encode(challenge),
            "bb3ba2fe17edb90a02c5b4dfcdd970b3a37103079e9ab9613671372cb075a833"
        );
    }

    #[test]
    fn challenge_is_deterministic() {
        let challenger = Challenger::with_keys(vec![EXAMPLE_KEY]);
        assert_eq!(
            challenger.new_challenge(EXAMPLE_IDENTITY),
            challenger.new_challenge(EXAMPLE_IDENTITY)
        );
        assert_ne!(
            challenger.new_challenge(EXAMPLE_IDENTITY),
            challenger.new_challenge(b"10.0.0.1")
        );
    }

    #[test]
    fn solved_challenge_is_accepted() {
        let challenger = Challenger::with_keys(vec![EXAMPLE_KEY]);
        let challenge = challenger.new_challenge(EXAMPLE_IDENTITY);
        // SHA-256(challenge || nonce) has 29 leading zero bits
        let nonce = 0x2c5a_133eu64.to_be_bytes();
        assert_eq!(
            challenger.is_solved_correctly(&challenge, &nonce, EXAMPLE_IDENTITY, 28),
            Ok(true)
        );
    }

    #[test]
    fn incorrect_nonce_is_denied() {
        let challenger = Challenger::with_keys(vec![EXAMPLE_KEY]);
        let challenge = challenger.new_challenge(EXAMPLE_IDENTITY);
        let nonce = 0x2c5a_133du64.to_be_bytes();
        assert_eq!(
            challenger.is_solved_correctly(&challenge, &nonce, EXAMPLE_IDENTITY, 28),
            Ok(false)
        );
    }

    #[test]
    fn insufficient_difficulty_is_denied() {
        let challenger = Challenger::with_keys(vec![EXAMPLE_KEY]);
        let challenge = challenger.new_challenge(EXAMPLE_IDENTITY);
        let nonce = 0x2c5a_133eu64.to_be_bytes();
        assert_eq!(
            challenger.is_solved_correctly(&challenge, &nonce, EXAMPLE_IDENTITY, 42),
            Ok(false)
        );
    }

    #[test]
    fn challenge_from_rotated_out_key_is_denied() {
        let old = Challenger::with_keys(vec![EXAMPLE_KEY]);
        let challenge = old.new_challenge(EXAMPLE_IDENTITY);
        let nonce = 0x2c5a_133eu64.to_be_bytes();

        let rotated = Challenger::with_keys(vec![[0x34; ROTATION_KEY_SIZE]]);
        assert_eq!(
            rotated.is_solved_correctly(&challenge, &nonce, EXAMPLE_IDENTITY, 28),
            Ok(false)
        );

        // keeping the old key anywhere in the rotation re-validates it
        let kept = Challenger::with_keys(vec![EXAMPLE_KEY, [0x34; ROTATION_KEY_SIZE]]);
        assert_eq!(
            kept.is_solved_correctly(&challenge, &nonce, EXAMPLE_IDENTITY, 28),
            Ok(true)
        );
    }

    #[test]
    fn challenge_bound_to_other_identity_is_denied() {
        let challenger = Challenger::with_keys(vec![EXAMPLE_KEY]);
        let challenge = challenger.new_challenge(EXAMPLE_IDENTITY);
        let nonce = 0x2c5a_133eu64.to_be_bytes();
        assert_eq!(
            challenger.is_solved_correctly(&challenge, &nonce, b"10.9.9.9", 28),
            Ok(false)
        );
    }

    #[test]
    fn invalid_difficulty_is_an_error() {
        let challenger = Challenger::with_keys(vec![EXAMPLE_KEY]);
        let challenge = challenger.new_challenge(EXAMPLE_IDENTITY);
        assert_eq!(
            challenger.is_solved_correctly(&challenge, &[0u8; NONCE_SIZE], EXAMPLE_IDENTITY, 256),
            Err(ChallengeError::InvalidDifficulty(256))
        );
    }

    #[test]
    fn simple_challenge_is_solved_quickly() {
        let challenge = [0xBBu8, 0x3B, 0xA2, 0xFE, 0x17, 0xED, 0xB9, 0x0A];
        let cancel = CancellationToken::new();
        let solution = solve_challenge(&challenge, 8, &cancel).unwrap();
        // nonce 256 is the first whose hash starts with a zero byte
        assert_eq!(u64::from_be_bytes(solution), 256);
        let check = crate::sha256_concat(&[&challenge, &solution]);
        assert_eq!(check[0], 0x00);
    }

    #[test]
    fn solver_honors_cancellation() {
        let challenge = [0xBBu8, 0x3B, 0xA2, 0xFE, 0x17, 0xED, 0xB9, 0x0A];
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            solve_challenge(&challenge, 42, &cancel),
            Err(ChallengeError::Cancelled)
        );
    }

    #[tokio::test]
    async fn difficult_challenge_times_out_with_deadline() {
        let challenge = vec![0xBBu8, 0x3B, 0xA2, 0xFE, 0x17, 0xED, 0xB9, 0x0A];
        let start = std::time::Instant::now();
        let result = solve_with_deadline(challenge, 42, Duration::from_millis(50)).await;
        assert_eq!(result, Err(ChallengeError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn key_rotation_drops_old_keys() {
        let shutdown = CancellationToken::new();
        let challenger = Challenger::new(Duration::from_millis(10), 2, shutdown.clone());
        let challenge = challenger.new_challenge(EXAMPLE_IDENTITY);

        // after enough rotations the initial key must be gone, so the old
        // challenge can no longer be reproduced from the rotation
        tokio::time::sleep(Duration::from_millis(100)).await;
        let reproducible = {
            let keys = challenger.keys.read().unwrap();
            assert!(keys.len() <= 2);
            keys.iter()
                .any(|key| crate::sha256_concat(&[&key[..], EXAMPLE_IDENTITY]) == challenge)
        };
        assert!(!reproducible);
        shutdown.cancel();
    }
}
