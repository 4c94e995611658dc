//! Nonce sequence for auth handshakes and ping correlation ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Strictly increasing nonce sequence, seeded from the wall clock.
///
/// The auth handshake signs a nonce that the server requires to be greater
/// than any nonce it has previously accepted for the same API key. Seeding
/// the counter with epoch microseconds at construction keeps the sequence
/// ahead of earlier process runs; each call then steps the counter, so
/// values never repeat within a run no matter how quickly they are taken.
#[derive(Debug)]
pub struct AuthNonce {
    counter: AtomicU64,
}

impl AuthNonce {
    /// Create a sequence starting at the current epoch-microsecond time.
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self {
            counter: AtomicU64::new(seed),
        }
    }

    /// Take the next nonce in the sequence.
    pub fn take(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for AuthNonce {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_seeded_from_clock() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_micros() as u64;
        let nonce = AuthNonce::new().take();
        assert!(nonce >= before);
    }

    #[test]
    fn test_nonce_never_repeats() {
        let sequence = AuthNonce::new();
        let first = sequence.take();
        for offset in 1..=1000 {
            assert_eq!(sequence.take(), first + offset);
        }
    }
}
