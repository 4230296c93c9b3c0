// SPDX-License-Identifier: MIT OR Apache-2.0

//! Randomness source shared by every component that generates key material.
use std::sync::Mutex;

use rand_chacha::rand_core::{SeedableRng, TryRngCore};
use thiserror::Error;

/// ChaCha20-based CSPRNG behind a mutex.
///
/// The key manager and both session engines draw from one shared instance, so the generator
/// must be callable through a shared reference. Seeded from the operating system by default.
#[derive(Debug)]
pub struct Rng {
    rng: Mutex<rand_chacha::ChaCha20Rng>,
}

impl Default for Rng {
    fn default() -> Self {
        Self {
            rng: Mutex::new(rand_chacha::ChaCha20Rng::from_os_rng()),
        }
    }
}

#[cfg(any(test, feature = "test_utils"))]
impl Rng {
    /// Deterministic generator for reproducible tests. Never use outside of them.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(rand_chacha::ChaCha20Rng::from_seed(seed)),
        }
    }
}

impl Rng {
    /// Fills a fixed-size array with fresh randomness, sized for key and nonce material.
    pub fn random_array<const N: usize>(&self) -> Result<[u8; N], RngError> {
        let mut rng = self.rng.lock().map_err(|_| RngError::LockPoisoned)?;
        let mut out = [0u8; N];
        rng.try_fill_bytes(&mut out)
            .map_err(|_| RngError::NotEnoughRandomness)?;
        Ok(out)
    }

    /// A random identifier, used for sender key chain ids.
    pub fn random_u32(&self) -> Result<u32, RngError> {
        let bytes: [u8; 4] = self.random_array()?;
        Ok(u32::from_be_bytes(bytes))
    }
}

#[derive(Debug, Error)]
pub enum RngError {
    #[error("rng lock is poisoned")]
    LockPoisoned,

    #[error("unable to collect enough randomness")]
    NotEnoughRandomness,
}
