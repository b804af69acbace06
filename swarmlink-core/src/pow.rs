//! Proof of work over (timestamp, ttl, destination, data).
//!
//! The target shrinks with difficulty, payload length and TTL; a nonce is valid when the
//! first eight bytes (big endian) of `sha512(nonce || sha512(payload))` do not exceed it.

use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha512};
use tracing::{debug, info, warn};

use crate::message::OutgoingMessage;

pub const DEFAULT_DIFFICULTY: u64 = 1;
/// Suggested difficulties at or above this are ignored.
pub const DIFFICULTY_CEILING: u64 = 100;
const NONCE_SIZE: usize = 8;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PowError {
    #[error("difficulty must be positive")]
    ZeroDifficulty,
    #[error("target underflow")]
    Target,
    #[error("nonce space exhausted")]
    Exhausted,
    #[error("computation aborted")]
    Aborted,
}

/// Process-wide current difficulty, updated from node suggestions.
#[derive(Debug)]
pub struct Difficulty {
    current: AtomicU64,
    ceiling: u64,
}

impl Default for Difficulty {
    fn default() -> Self {
        Self::new(DEFAULT_DIFFICULTY, DIFFICULTY_CEILING)
    }
}

impl Difficulty {
    pub fn new(initial: u64, ceiling: u64) -> Self {
        Self {
            current: AtomicU64::new(initial),
            ceiling,
        }
    }

    pub fn get(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Adopt a node-suggested difficulty if it is positive and below the ceiling.
    pub fn suggest(&self, suggested: u64) -> bool {
        if suggested == 0 || suggested >= self.ceiling {
            warn!(suggested, ceiling = self.ceiling, "ignoring suggested difficulty");
            return false;
        }
        let previous = self.current.swap(suggested, Ordering::AcqRel);
        if previous != suggested {
            info!(previous, current = suggested, "proof of work difficulty updated");
        }
        true
    }
}

fn payload(message: &OutgoingMessage, timestamp: u64) -> Vec<u8> {
    format!(
        "{}{}{}{}",
        timestamp,
        message.ttl_ms,
        message.destination,
        message.encoded_data()
    )
    .into_bytes()
}

fn target(payload_len: usize, ttl_ms: u64, difficulty: u64) -> Result<u64, PowError> {
    if difficulty == 0 {
        return Err(PowError::ZeroDifficulty);
    }
    let total_len = (payload_len + NONCE_SIZE) as u128;
    let ttl_secs = (ttl_ms / 1000) as u128;
    let inner_frac = ttl_secs * total_len / (1u128 << 16);
    let denominator = difficulty as u128 * (total_len + inner_frac);
    if denominator == 0 {
        return Err(PowError::Target);
    }
    u64::try_from(u64::MAX as u128 / denominator).map_err(|_| PowError::Target)
}

fn trial(nonce: u64, initial_hash: &[u8]) -> u64 {
    let mut hasher = Sha512::new();
    hasher.update(nonce.to_be_bytes());
    hasher.update(initial_hash);
    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(first)
}

/// Find a nonce for `message` stamped at `timestamp`. CPU bound: run off latency-sensitive tasks.
pub fn calculate(message: &OutgoingMessage, timestamp: u64, difficulty: u64) -> Result<String, PowError> {
    let payload = payload(message, timestamp);
    let target = target(payload.len(), message.ttl_ms, difficulty)?;
    let initial_hash = Sha512::digest(&payload);
    let mut nonce: u64 = 0;
    loop {
        if trial(nonce, &initial_hash) <= target {
            debug!(nonce, difficulty, "proof of work found");
            return Ok(BASE64.encode(nonce.to_be_bytes()));
        }
        nonce = nonce.checked_add(1).ok_or(PowError::Exhausted)?;
    }
}

/// Check a base64 nonce produced by [`calculate`].
pub fn verify(message: &OutgoingMessage, timestamp: u64, nonce: &str, difficulty: u64) -> bool {
    let Ok(bytes) = BASE64.decode(nonce.as_bytes()) else {
        return false;
    };
    let Ok(bytes) = <[u8; NONCE_SIZE]>::try_from(bytes.as_slice()) else {
        return false;
    };
    let payload = payload(message, timestamp);
    let Ok(target) = target(payload.len(), message.ttl_ms, difficulty) else {
        return false;
    };
    trial(u64::from_be_bytes(bytes), &Sha512::digest(&payload)) <= target
}
