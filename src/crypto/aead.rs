// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authenticated encryption (ChaCha20-Poly1305) for message payloads.
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use thiserror::Error;

pub const NONCE_SIZE: usize = 12;

pub const KEY_SIZE: usize = 32;

/// Encrypts a plaintext, binding the optional associated data into the authentication tag.
pub fn aead_encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::EncryptionFailed)
}

/// Decrypts and authenticates a ciphertext produced by [`aead_encrypt`].
pub fn aead_decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::DecryptionFailed)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("aead encryption failed")]
    EncryptionFailed,

    #[error("aead decryption failed, ciphertext may be tampered or key mismatched")]
    DecryptionFailed,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{aead_decrypt, aead_encrypt};

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let rng = Rng::from_seed([1; 32]);
        let key = rng.random_array().unwrap();
        let nonce = rng.random_array().unwrap();

        let ciphertext = aead_encrypt(&key, &nonce, b"an invitation to all", b"header").unwrap();
        assert_ne!(ciphertext.as_slice(), b"an invitation to all");

        let plaintext = aead_decrypt(&key, &nonce, &ciphertext, b"header").unwrap();
        assert_eq!(plaintext, b"an invitation to all");
    }

    #[test]
    fn wrong_key_fails() {
        let rng = Rng::from_seed([1; 32]);
        let key = rng.random_array().unwrap();
        let wrong_key = rng.random_array().unwrap();
        let nonce = rng.random_array().unwrap();

        let ciphertext = aead_encrypt(&key, &nonce, b"secret", b"").unwrap();
        assert!(aead_decrypt(&wrong_key, &nonce, &ciphertext, b"").is_err());
    }

    #[test]
    fn tampered_aad_fails() {
        let rng = Rng::from_seed([1; 32]);
        let key = rng.random_array().unwrap();
        let nonce = rng.random_array().unwrap();

        let ciphertext = aead_encrypt(&key, &nonce, b"secret", b"header").unwrap();
        assert!(aead_decrypt(&key, &nonce, &ciphertext, b"other header").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let rng = Rng::from_seed([1; 32]);
        let key = rng.random_array().unwrap();
        let nonce = rng.random_array().unwrap();

        let mut ciphertext = aead_encrypt(&key, &nonce, b"secret", b"").unwrap();
        ciphertext[0] ^= 0xFF;
        assert!(aead_decrypt(&key, &nonce, &ciphertext, b"").is_err());
    }
}
