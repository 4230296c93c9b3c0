// SPDX-License-Identifier: MIT OR Apache-2.0

//! X25519 key material for Diffie-Hellman key agreement.
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

use crate::crypto::secret::Secret;

pub const PUBLIC_KEY_SIZE: usize = 32;

pub const SECRET_KEY_SIZE: usize = 32;

/// X25519 secret key.
///
/// The raw bytes are stored unclamped; clamping is applied by the scalar-multiplication
/// implementation on every use.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(Secret<SECRET_KEY_SIZE>);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.0.as_bytes());
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    /// Performs a Diffie-Hellman key agreement between this secret and the given public key.
    pub fn diffie_hellman(&self, their_key: &PublicKey) -> Secret<32> {
        let secret = StaticSecret::from(*self.0.as_bytes());
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(their_key.0));
        Secret::from_bytes(shared.to_bytes())
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        self.0.as_bytes()
    }
}

/// X25519 public key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }
}
