// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public key bundles exchanged through the server key directory.
//!
//! A peer's bundle carries their identity key, their latest signed pre-key and, when the server
//! still has some left, a one-time pre-key. Bundles are what an X3DH initiator consumes to
//! establish a session with an offline peer.
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::identity::SIGNATURE_SIZE;
use crate::crypto::x25519::PublicKey;

/// Unique identifier of a signed pre-key.
pub type SignedPrekeyId = u32;

/// Unique identifier of a one-time pre-key.
pub type OneTimePrekeyId = u32;

/// Public half of a signed pre-key, with the signature made by the owner's identity key over the
/// pre-key bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPrekeyPublic {
    pub key_id: SignedPrekeyId,
    pub public_key: PublicKey,
    pub signature: Vec<u8>,
}

/// Public half of a one-time pre-key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePrekeyPublic {
    pub key_id: OneTimePrekeyId,
    pub public_key: PublicKey,
}

/// A peer's pre-key bundle as fetched from the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyBundle {
    /// The peer's Ed25519 identity public key.
    pub identity_key: [u8; 32],

    pub signed_prekey: SignedPrekeyPublic,

    pub one_time_prekey: Option<OneTimePrekeyPublic>,
}

impl PrekeyBundle {
    /// Checks the signed pre-key signature against the bundle's identity key.
    pub fn verify(&self) -> Result<(), KeyBundleError> {
        let identity_key = VerifyingKey::from_bytes(&self.identity_key)
            .map_err(|_| KeyBundleError::InvalidIdentityKey)?;

        let signature_bytes: [u8; SIGNATURE_SIZE] = self
            .signed_prekey
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| KeyBundleError::InvalidSignature)?;
        let signature = Signature::from_bytes(&signature_bytes);

        identity_key
            .verify(self.signed_prekey.public_key.as_bytes(), &signature)
            .map_err(|_| KeyBundleError::InvalidSignature)?;

        Ok(())
    }

    pub fn identity_key(&self) -> Result<VerifyingKey, KeyBundleError> {
        VerifyingKey::from_bytes(&self.identity_key).map_err(|_| KeyBundleError::InvalidIdentityKey)
    }
}

/// Public key material uploaded to the server during registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationKeys {
    pub identity_key: [u8; 32],
    pub signed_prekey: SignedPrekeyPublic,
    pub one_time_prekeys: Vec<OneTimePrekeyPublic>,
}

#[derive(Debug, Error)]
pub enum KeyBundleError {
    #[error("identity key in bundle is not a valid ed25519 public key")]
    InvalidIdentityKey,

    #[error("signed prekey signature verification failed")]
    InvalidSignature,
}
