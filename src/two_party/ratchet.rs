// SPDX-License-Identifier: MIT OR Apache-2.0

//! Double Ratchet for ongoing pairwise message encryption.
//!
//! After X3DH establishes a shared secret, the ratchet provides forward secrecy, break-in
//! recovery and out-of-order decryption via skipped message keys.
//!
//! Reference: <https://signal.org/docs/specifications/doubleratchet/>
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::aead::{AeadError, NONCE_SIZE, aead_decrypt, aead_encrypt};
use crate::crypto::hkdf::{HkdfError, hkdf_sha256};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError, Secret};

/// Maximum number of skipped message keys to store.
///
/// Bounds the work a malicious sender can cause by claiming a huge message counter.
pub const MAX_SKIP: u32 = 1000;

const ROOT_INFO: &[u8] = b"palaver-ratchet-root";
const MESSAGE_KEY_INFO: &[u8] = b"palaver-message-key";

/// Message header sent alongside the ciphertext, also bound into the authentication tag as
/// associated data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key.
    pub ratchet_key: PublicKey,

    /// Number of messages in the previous sending chain.
    pub previous_chain_length: u32,

    /// Message number in the current sending chain.
    pub message_number: u32,
}

/// One ratchet-encrypted message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

/// Message key retained for an out-of-order message that was skipped over.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SkippedMessageKey {
    ratchet_key: PublicKey,
    message_number: u32,
    message_key: Secret<32>,
}

/// Pairwise Double Ratchet state, one per peer.
///
/// State only ever advances. Callers persist it (via [`RatchetState::to_bytes`]) after every
/// successful encrypt or decrypt.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    sending_key: Option<SecretKey>,
    receiving_key: Option<PublicKey>,
    root_key: Secret<32>,
    sending_chain: Option<Secret<32>>,
    receiving_chain: Option<Secret<32>>,
    send_count: u32,
    recv_count: u32,
    previous_send_count: u32,
    skipped_keys: Vec<SkippedMessageKey>,
}

impl RatchetState {
    /// Initializes the session on the initiating side.
    ///
    /// The peer's signed pre-key doubles as their first ratchet key, so the first DH ratchet
    /// step happens right here.
    pub fn init_initiator(
        rng: &Rng,
        shared_secret: Secret<32>,
        their_ratchet_key: PublicKey,
    ) -> Result<Self, RatchetError> {
        let our_secret = SecretKey::from_bytes(rng.random_array()?);
        let dh_output = our_secret.diffie_hellman(&their_ratchet_key);
        let (root_key, sending_chain) = kdf_root(&shared_secret, &dh_output)?;

        Ok(Self {
            sending_key: Some(our_secret),
            receiving_key: Some(their_ratchet_key),
            root_key,
            sending_chain: Some(sending_chain),
            receiving_chain: None,
            send_count: 0,
            recv_count: 0,
            previous_send_count: 0,
            skipped_keys: Vec::new(),
        })
    }

    /// Initializes the session on the responding side, with our signed pre-key as the first
    /// ratchet key.
    pub fn init_responder(shared_secret: Secret<32>, our_ratchet_secret: SecretKey) -> Self {
        Self {
            sending_key: Some(our_ratchet_secret),
            receiving_key: None,
            root_key: shared_secret,
            sending_chain: None,
            receiving_chain: None,
            send_count: 0,
            recv_count: 0,
            previous_send_count: 0,
            skipped_keys: Vec::new(),
        }
    }

    /// Advances the sending chain one step and encrypts the plaintext with the derived message
    /// key. The serialized header is the associated data.
    pub fn encrypt(&mut self, rng: &Rng, plaintext: &[u8]) -> Result<EncryptedMessage, RatchetError> {
        let sending_key = self
            .sending_key
            .as_ref()
            .ok_or(RatchetError::NotEstablished)?;
        let sending_chain = self
            .sending_chain
            .as_ref()
            .ok_or(RatchetError::NotEstablished)?;

        let (message_key, next_chain) = kdf_chain(sending_chain)?;
        self.sending_chain = Some(next_chain);

        let header = MessageHeader {
            ratchet_key: sending_key.public_key(),
            previous_chain_length: self.previous_send_count,
            message_number: self.send_count,
        };
        self.send_count += 1;

        let nonce: [u8; NONCE_SIZE] = rng.random_array()?;
        let header_aad = serde_json::to_vec(&header)?;
        let ciphertext = aead_encrypt(message_key.as_bytes(), &nonce, plaintext, &header_aad)?;

        Ok(EncryptedMessage {
            header,
            ciphertext,
            nonce,
        })
    }

    /// Decrypts an incoming message, performing a DH ratchet step when the peer moved to a new
    /// ratchet key and deriving skipped keys for anything jumped over.
    pub fn decrypt(&mut self, rng: &Rng, message: &EncryptedMessage) -> Result<Vec<u8>, RatchetError> {
        // A message we already skipped over carries its own retained key.
        if let Some(index) = self.skipped_keys.iter().position(|skipped| {
            skipped.ratchet_key == message.header.ratchet_key
                && skipped.message_number == message.header.message_number
        }) {
            let skipped = self.skipped_keys.swap_remove(index);
            return decrypt_with_key(&skipped.message_key, message);
        }

        let their_key_changed = self.receiving_key != Some(message.header.ratchet_key);
        if their_key_changed {
            // Retain keys for the unconsumed tail of the finished receiving chain.
            if self.receiving_chain.is_some() {
                self.skip_messages(message.header.previous_chain_length)?;
            }
            self.dh_ratchet(rng, message.header.ratchet_key)?;
        }

        self.skip_messages(message.header.message_number)?;

        let receiving_chain = self
            .receiving_chain
            .as_ref()
            .ok_or(RatchetError::NotEstablished)?;
        let (message_key, next_chain) = kdf_chain(receiving_chain)?;
        self.receiving_chain = Some(next_chain);
        self.recv_count = message.header.message_number + 1;

        decrypt_with_key(&message_key, message)
    }

    /// DH ratchet step against a new remote ratchet key: derive the receiving chain for their
    /// new key, then rotate our own key pair and derive a fresh sending chain.
    fn dh_ratchet(&mut self, rng: &Rng, their_new_key: PublicKey) -> Result<(), RatchetError> {
        self.previous_send_count = self.send_count;
        self.send_count = 0;
        self.recv_count = 0;
        self.receiving_key = Some(their_new_key);

        if let Some(our_secret) = &self.sending_key {
            let dh_output = our_secret.diffie_hellman(&their_new_key);
            let (next_root, receiving_chain) = kdf_root(&self.root_key, &dh_output)?;
            self.root_key = next_root;
            self.receiving_chain = Some(receiving_chain);
        }

        let next_secret = SecretKey::from_bytes(rng.random_array()?);
        let dh_output = next_secret.diffie_hellman(&their_new_key);
        let (next_root, sending_chain) = kdf_root(&self.root_key, &dh_output)?;

        self.root_key = next_root;
        self.sending_chain = Some(sending_chain);
        self.sending_key = Some(next_secret);

        Ok(())
    }

    /// Advances the receiving chain up to (excluding) the given message number, retaining the
    /// derived keys for later out-of-order arrival.
    fn skip_messages(&mut self, until: u32) -> Result<(), RatchetError> {
        if self.recv_count + MAX_SKIP < until {
            return Err(RatchetError::TooManySkipped);
        }

        let Some(receiving_chain) = &self.receiving_chain else {
            return Ok(());
        };
        let Some(ratchet_key) = self.receiving_key else {
            return Ok(());
        };

        let mut current_chain = receiving_chain.clone();
        while self.recv_count < until {
            let (message_key, next_chain) = kdf_chain(&current_chain)?;
            current_chain = next_chain;

            self.skipped_keys.push(SkippedMessageKey {
                ratchet_key,
                message_number: self.recv_count,
                message_key,
            });
            self.recv_count += 1;
        }

        self.receiving_chain = Some(current_chain);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Root KDF: mixes a DH output into the root key, yielding the next root key and a chain key.
fn kdf_root(
    root_key: &Secret<32>,
    dh_output: &Secret<32>,
) -> Result<(Secret<32>, Secret<32>), HkdfError> {
    let mut okm: [u8; 64] = hkdf_sha256(
        Some(root_key.as_bytes()),
        dh_output.as_bytes(),
        ROOT_INFO,
    )?;

    let mut next_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    okm.zeroize();

    Ok((Secret::from_bytes(next_root), Secret::from_bytes(chain_key)))
}

/// Chain KDF: derives the next message key and the next chain key from the current chain key.
fn kdf_chain(chain_key: &Secret<32>) -> Result<(Secret<32>, Secret<32>), HkdfError> {
    let message_key: [u8; 32] = hkdf_sha256(Some(chain_key.as_bytes()), &[0x01], MESSAGE_KEY_INFO)?;
    let next_chain: [u8; 32] = hkdf_sha256(Some(chain_key.as_bytes()), &[0x02], MESSAGE_KEY_INFO)?;
    Ok((Secret::from_bytes(message_key), Secret::from_bytes(next_chain)))
}

/// Authenticates against the serialized header first; messages from before header binding was
/// introduced carry no associated data, so an empty AAD is tried second.
fn decrypt_with_key(
    message_key: &Secret<32>,
    message: &EncryptedMessage,
) -> Result<Vec<u8>, RatchetError> {
    let header_aad = serde_json::to_vec(&message.header)?;
    if let Ok(plaintext) = aead_decrypt(
        message_key.as_bytes(),
        &message.nonce,
        &message.ciphertext,
        &header_aad,
    ) {
        return Ok(plaintext);
    }

    aead_decrypt(message_key.as_bytes(), &message.nonce, &message.ciphertext, &[])
        .map_err(RatchetError::from)
}

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("session is not ready for this operation, no chain established yet")]
    NotEstablished,

    #[error("message is more than {MAX_SKIP} steps ahead of the receiving chain")]
    TooManySkipped,

    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("ratchet state encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use crate::crypto::x25519::SecretKey;
    use crate::crypto::{Rng, Secret};

    use super::{RatchetError, RatchetState};

    fn setup_sessions(rng: &Rng) -> (RatchetState, RatchetState) {
        // Stands in for the X3DH output.
        let shared_secret: [u8; 32] = rng.random_array().unwrap();

        // Bob's signed pre-key is his first ratchet key.
        let bob_ratchet_secret = SecretKey::from_bytes(rng.random_array().unwrap());

        let alice = RatchetState::init_initiator(
            rng,
            Secret::from_bytes(shared_secret),
            bob_ratchet_secret.public_key(),
        )
        .unwrap();
        let bob = RatchetState::init_responder(Secret::from_bytes(shared_secret), bob_ratchet_secret);

        (alice, bob)
    }

    #[test]
    fn two_way_exchange() {
        let rng = Rng::from_seed([1; 32]);
        let (mut alice, mut bob) = setup_sessions(&rng);

        let message = alice.encrypt(&rng, b"hello bob").unwrap();
        assert_eq!(bob.decrypt(&rng, &message).unwrap(), b"hello bob");

        let reply = bob.encrypt(&rng, b"hello alice").unwrap();
        assert_eq!(alice.decrypt(&rng, &reply).unwrap(), b"hello alice");
    }

    #[test]
    fn multiple_messages_same_direction() {
        let rng = Rng::from_seed([2; 32]);
        let (mut alice, mut bob) = setup_sessions(&rng);

        for i in 0..5 {
            let text = format!("message {i}");
            let message = alice.encrypt(&rng, text.as_bytes()).unwrap();
            assert_eq!(bob.decrypt(&rng, &message).unwrap(), text.as_bytes());
        }
    }

    #[test]
    fn out_of_order_messages() {
        let rng = Rng::from_seed([3; 32]);
        let (mut alice, mut bob) = setup_sessions(&rng);

        let first = alice.encrypt(&rng, b"first").unwrap();
        let second = alice.encrypt(&rng, b"second").unwrap();
        let third = alice.encrypt(&rng, b"third").unwrap();

        assert_eq!(bob.decrypt(&rng, &third).unwrap(), b"third");
        assert_eq!(bob.decrypt(&rng, &first).unwrap(), b"first");
        assert_eq!(bob.decrypt(&rng, &second).unwrap(), b"second");
    }

    #[test]
    fn ping_pong_conversation() {
        let rng = Rng::from_seed([4; 32]);
        let (mut alice, mut bob) = setup_sessions(&rng);

        for i in 0..20 {
            let text = format!("message {i}");
            let (sender, receiver) = if i % 2 == 0 {
                (&mut alice, &mut bob)
            } else {
                (&mut bob, &mut alice)
            };
            let message = sender.encrypt(&rng, text.as_bytes()).unwrap();
            assert_eq!(receiver.decrypt(&rng, &message).unwrap(), text.as_bytes());
        }
    }

    #[test]
    fn responder_cannot_send_first() {
        let rng = Rng::from_seed([5; 32]);
        let (_, mut bob) = setup_sessions(&rng);

        assert!(matches!(
            bob.encrypt(&rng, b"too early"),
            Err(RatchetError::NotEstablished)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let rng = Rng::from_seed([6; 32]);
        let (mut alice, mut bob) = setup_sessions(&rng);

        let mut message = alice.encrypt(&rng, b"secret").unwrap();
        message.ciphertext[0] ^= 0xFF;

        assert!(bob.decrypt(&rng, &message).is_err());
    }

    #[test]
    fn old_message_keys_are_gone_after_advance() {
        let rng = Rng::from_seed([7; 32]);
        let (mut alice, mut bob) = setup_sessions(&rng);

        let first = alice.encrypt(&rng, b"first").unwrap();
        let second = alice.encrypt(&rng, b"second").unwrap();

        assert_eq!(bob.decrypt(&rng, &first).unwrap(), b"first");
        assert_eq!(bob.decrypt(&rng, &second).unwrap(), b"second");

        // The chain advanced past both messages, replaying the first one must fail.
        assert!(bob.decrypt(&rng, &first).is_err());
    }

    #[test]
    fn state_survives_serialization() {
        let rng = Rng::from_seed([8; 32]);
        let (mut alice, mut bob) = setup_sessions(&rng);

        let before = alice.encrypt(&rng, b"before").unwrap();
        assert_eq!(bob.decrypt(&rng, &before).unwrap(), b"before");

        let mut alice = RatchetState::from_bytes(&alice.to_bytes().unwrap()).unwrap();
        let mut bob = RatchetState::from_bytes(&bob.to_bytes().unwrap()).unwrap();

        let reply = bob.encrypt(&rng, b"after").unwrap();
        assert_eq!(alice.decrypt(&rng, &reply).unwrap(), b"after");

        let counter = alice.encrypt(&rng, b"and back").unwrap();
        assert_eq!(bob.decrypt(&rng, &counter).unwrap(), b"and back");
    }

    #[test]
    fn large_message() {
        let rng = Rng::from_seed([9; 32]);
        let (mut alice, mut bob) = setup_sessions(&rng);

        let large = vec![0x42u8; 65536];
        let message = alice.encrypt(&rng, &large).unwrap();
        assert_eq!(bob.decrypt(&rng, &message).unwrap(), large);
    }
}
