// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 identity keys and identity verification helpers.
//!
//! Each device holds exactly one long-term identity key pair. The public half is what peers pin
//! on first contact, and what signs every advertised pre-key.
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::crypto::{Rng, RngError};

pub const SIGNATURE_SIZE: usize = 64;

/// Generates a new Ed25519 identity key pair.
pub fn generate_identity_key(rng: &Rng) -> Result<SigningKey, RngError> {
    Ok(SigningKey::from_bytes(&rng.random_array()?))
}

/// Computes the fingerprint (hex-encoded SHA-256) of a public identity key.
pub fn fingerprint(public_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(public_key.as_bytes());
    hex::encode(digest)
}

/// Computes a safety number for two identity keys, shown to users for out-of-band verification.
///
/// The result is deterministic regardless of argument order.
pub fn safety_number(key_a: &VerifyingKey, key_b: &VerifyingKey) -> String {
    let (first, second) = if key_a.as_bytes() < key_b.as_bytes() {
        (key_a, key_b)
    } else {
        (key_b, key_a)
    };

    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update(second.as_bytes());
    let digest = hasher.finalize();

    digest
        .chunks(4)
        .map(|chunk| {
            let n = u32::from_be_bytes(chunk.try_into().unwrap_or([0; 4]));
            format!("{:05}", n % 100_000)
        })
        .collect::<Vec<_>>()
        .join(" ")
}
