//! The injected randomness source for all noise mechanisms.

use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Cryptographically adequate random stream used by mechanisms and partition
/// selection.
///
/// Backed by ChaCha20. The default constructor draws the key from OS entropy;
/// tests use [`SecureRng::from_seed_value`] for deterministic streams.
#[derive(Clone, Debug)]
pub struct SecureRng {
    inner: ChaCha20Rng,
}

impl SecureRng {
    /// Create a stream keyed from OS entropy.
    pub fn new() -> Self {
        Self {
            inner: ChaCha20Rng::from_entropy(),
        }
    }

    /// Create a deterministic stream from a 64-bit seed.
    pub fn from_seed_value(seed: u64) -> Self {
        Self {
            inner: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    /// Uniform double in the open interval (0, 1).
    pub fn uniform_double(&mut self) -> f64 {
        // 53 random mantissa bits; reject exact zero to keep the interval open.
        loop {
            let value = (self.inner.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64);
            if value > 0.0 {
                return value;
            }
        }
    }
}

impl Default for SecureRng {
    fn default() -> Self {
        Self::new()
    }
}

impl RngCore for SecureRng {
    fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.inner.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.inner.try_fill_bytes(dest)
    }
}

impl CryptoRng for SecureRng {}
