// SPDX-License-Identifier: MIT OR Apache-2.0

//! X3DH key agreement to establish a shared secret with a peer who may be offline.
//!
//! The initiator consumes the peer's pre-key bundle, the responder later replays the agreement
//! from the handshake header of the first message.
//!
//! Reference: <https://signal.org/docs/specifications/x3dh/>
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::hkdf::{HkdfError, hkdf_sha256};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError, Secret};
use crate::key_bundle::{KeyBundleError, PrekeyBundle};

const X3DH_INFO: &[u8] = b"palaver-x3dh-shared-secret";

/// 32-byte filler prepended to the KDF input per the X3DH spec.
const KDF_FILLER: [u8; 32] = [0xFF; 32];

/// Initiator's output of the key agreement.
pub struct InitiateResult {
    pub shared_secret: Secret<32>,

    /// Ephemeral public key to be sent to the responder in the handshake header.
    pub ephemeral_key: PublicKey,

    /// Associated data binding both identities to the first message.
    pub associated_data: Vec<u8>,
}

/// Responder's output of the key agreement.
pub struct RespondResult {
    pub shared_secret: Secret<32>,
    pub associated_data: Vec<u8>,
}

/// Establishes a shared secret with a peer from their published pre-key bundle.
///
/// Verifies the signed pre-key signature before any DH computation takes place.
pub fn initiate(
    rng: &Rng,
    our_identity_key: &SigningKey,
    their_bundle: &PrekeyBundle,
) -> Result<InitiateResult, X3dhError> {
    their_bundle.verify()?;
    let their_identity_key = their_bundle.identity_key()?;

    let ephemeral_secret = SecretKey::from_bytes(rng.random_array()?);
    let ephemeral_key = ephemeral_secret.public_key();

    let our_agreement_secret = identity_to_agreement_secret(our_identity_key);
    let their_agreement_key = identity_to_agreement_key(&their_identity_key);

    // DH1 = DH(IK_A, SPK_B), DH2 = DH(EK_A, IK_B), DH3 = DH(EK_A, SPK_B) and, when a one-time
    // pre-key is part of the bundle, DH4 = DH(EK_A, OPK_B).
    let dh_1 = our_agreement_secret.diffie_hellman(&their_bundle.signed_prekey.public_key);
    let dh_2 = ephemeral_secret.diffie_hellman(&their_agreement_key);
    let dh_3 = ephemeral_secret.diffie_hellman(&their_bundle.signed_prekey.public_key);
    let dh_4 = their_bundle
        .one_time_prekey
        .as_ref()
        .map(|prekey| ephemeral_secret.diffie_hellman(&prekey.public_key));

    let shared_secret = derive_shared_secret(&dh_1, &dh_2, &dh_3, dh_4.as_ref())?;
    let associated_data =
        associated_data(&our_identity_key.verifying_key(), &their_identity_key);

    Ok(InitiateResult {
        shared_secret,
        ephemeral_key,
        associated_data,
    })
}

/// Re-derives the shared secret on the responding side from the initiator's handshake header.
///
/// The one-time pre-key secret is optional in both directions: the initiator may not have been
/// handed one, and this device may have already consumed the referenced one in a race.
pub fn respond(
    our_identity_key: &SigningKey,
    our_signed_prekey_secret: &SecretKey,
    our_onetime_prekey_secret: Option<&SecretKey>,
    their_identity_key: &VerifyingKey,
    their_ephemeral_key: &PublicKey,
) -> Result<RespondResult, X3dhError> {
    let our_agreement_secret = identity_to_agreement_secret(our_identity_key);
    let their_agreement_key = identity_to_agreement_key(their_identity_key);

    // Mirrors the initiator's computation with the private halves swapped.
    let dh_1 = our_signed_prekey_secret.diffie_hellman(&their_agreement_key);
    let dh_2 = our_agreement_secret.diffie_hellman(their_ephemeral_key);
    let dh_3 = our_signed_prekey_secret.diffie_hellman(their_ephemeral_key);
    let dh_4 = our_onetime_prekey_secret.map(|secret| secret.diffie_hellman(their_ephemeral_key));

    let shared_secret = derive_shared_secret(&dh_1, &dh_2, &dh_3, dh_4.as_ref())?;
    let associated_data = associated_data(their_identity_key, &our_identity_key.verifying_key());

    Ok(RespondResult {
        shared_secret,
        associated_data,
    })
}

/// Converts an Ed25519 identity public key to its X25519 form via the birational map between the
/// two curves.
fn identity_to_agreement_key(identity_key: &VerifyingKey) -> PublicKey {
    PublicKey::from_bytes(identity_key.to_montgomery().to_bytes())
}

/// Converts an Ed25519 identity signing key to an X25519 secret.
///
/// The X25519 secret is the first 32 bytes of SHA-512 of the signing key seed, the same scalar
/// derivation Ed25519 applies internally.
fn identity_to_agreement_secret(identity_key: &SigningKey) -> SecretKey {
    let hash = Sha512::digest(identity_key.as_bytes());
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(&hash[..32]);
    let secret = SecretKey::from_bytes(secret_bytes);
    secret_bytes.zeroize();
    secret
}

fn derive_shared_secret(
    dh_1: &Secret<32>,
    dh_2: &Secret<32>,
    dh_3: &Secret<32>,
    dh_4: Option<&Secret<32>>,
) -> Result<Secret<32>, X3dhError> {
    let mut kdf_input = Vec::with_capacity(32 * 5);
    kdf_input.extend_from_slice(&KDF_FILLER);
    kdf_input.extend_from_slice(dh_1.as_bytes());
    kdf_input.extend_from_slice(dh_2.as_bytes());
    kdf_input.extend_from_slice(dh_3.as_bytes());
    if let Some(dh_4) = dh_4 {
        kdf_input.extend_from_slice(dh_4.as_bytes());
    }

    let okm: [u8; 32] = hkdf_sha256(Some(&[0u8; 32]), &kdf_input, X3DH_INFO)?;
    kdf_input.zeroize();

    Ok(Secret::from_bytes(okm))
}

/// AD = Encode(IK_initiator) || Encode(IK_responder).
fn associated_data(
    initiator_identity: &VerifyingKey,
    responder_identity: &VerifyingKey,
) -> Vec<u8> {
    let mut ad = Vec::with_capacity(64);
    ad.extend_from_slice(initiator_identity.as_bytes());
    ad.extend_from_slice(responder_identity.as_bytes());
    ad
}

#[derive(Debug, Error)]
pub enum X3dhError {
    #[error(transparent)]
    KeyBundle(#[from] KeyBundleError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Rng(#[from] RngError),
}
