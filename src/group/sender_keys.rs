// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sender Keys for group messaging.
//!
//! Pairwise ratchets for every member pair would cost O(n^2) encryptions per group message.
//! Instead each member keeps one forward-secure symmetric chain per channel, publishes its seed
//! as a distribution, and every other member derives a matching receive chain from it. A
//! message is encrypted once and decryptable by all current members.
//!
//! On membership shrink all remaining members regenerate their chains, so removed members
//! cannot follow the conversation (see the group session engine for rotation).
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::aead::{AeadError, NONCE_SIZE, aead_decrypt, aead_encrypt};
use crate::crypto::hkdf::{HkdfError, hkdf_sha256};
use crate::crypto::{Rng, RngError, Secret};

const SENDER_KEY_INFO: &[u8] = b"palaver-sender-key-chain";

/// Maximum number of message keys cached per receive chain.
pub const MAX_SKIP: u32 = 2000;

/// Seed material a sender publishes so other members can derive a receive chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SenderKeyDistribution {
    pub chain_id: u32,

    /// Chain position the seed is valid from. Members joining later cannot read messages sent
    /// before they received the distribution.
    pub iteration: u32,

    pub chain_key: Secret<32>,

    /// User id of the publishing member.
    pub sender_id: String,
}

/// One sender-key encrypted group message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SenderKeyMessage {
    pub chain_id: u32,
    pub iteration: u32,
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

/// Our own send chain for one channel.
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderChain {
    chain_id: u32,
    chain_key: Secret<32>,
    iteration: u32,
    sender_id: String,
}

impl SenderChain {
    /// Creates a fresh chain together with the distribution other members need to follow it.
    pub fn generate(
        rng: &Rng,
        sender_id: &str,
    ) -> Result<(Self, SenderKeyDistribution), SenderKeyError> {
        let chain_key: [u8; 32] = rng.random_array()?;
        let chain_id = rng.random_u32()?;

        let chain = Self {
            chain_id,
            chain_key: Secret::from_bytes(chain_key),
            iteration: 0,
            sender_id: sender_id.to_owned(),
        };

        let distribution = SenderKeyDistribution {
            chain_id,
            iteration: 0,
            chain_key: Secret::from_bytes(chain_key),
            sender_id: sender_id.to_owned(),
        };

        Ok((chain, distribution))
    }

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }

    /// Advances the chain one step and encrypts with the derived message key.
    pub fn encrypt(&mut self, rng: &Rng, plaintext: &[u8]) -> Result<SenderKeyMessage, SenderKeyError> {
        let (message_key, next_chain) = advance_chain(&self.chain_key)?;
        self.chain_key = next_chain;
        let iteration = self.iteration;
        self.iteration += 1;

        let nonce: [u8; NONCE_SIZE] = rng.random_array()?;
        let ciphertext = aead_encrypt(message_key.as_bytes(), &nonce, plaintext, &[])?;

        Ok(SenderKeyMessage {
            chain_id: self.chain_id,
            iteration,
            ciphertext,
            nonce,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A receive chain following one sender's chain in one channel.
#[derive(Clone, Serialize, Deserialize)]
pub struct ReceiverChain {
    chain_id: u32,
    chain_key: Secret<32>,
    iteration: u32,
    sender_id: String,

    /// Message keys derived ahead of time for out-of-order arrival, keyed by iteration.
    cached_keys: HashMap<u32, Secret<32>>,
}

impl ReceiverChain {
    pub fn from_distribution(distribution: &SenderKeyDistribution) -> Self {
        Self {
            chain_id: distribution.chain_id,
            chain_key: distribution.chain_key.clone(),
            iteration: distribution.iteration,
            sender_id: distribution.sender_id.clone(),
            cached_keys: HashMap::new(),
        }
    }

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }

    /// Decrypts a message from this sender.
    ///
    /// Messages ahead of the chain position advance it, caching the keys in between; messages
    /// behind it are only readable while their key is still cached. The chain never rewinds.
    pub fn decrypt(&mut self, message: &SenderKeyMessage) -> Result<Vec<u8>, SenderKeyError> {
        if message.chain_id != self.chain_id {
            return Err(SenderKeyError::UnknownChain(message.chain_id));
        }

        if let Some(message_key) = self.cached_keys.remove(&message.iteration) {
            return decrypt_with_key(&message_key, message);
        }

        if message.iteration > self.iteration {
            if message.iteration - self.iteration > MAX_SKIP {
                return Err(SenderKeyError::TooManySkipped);
            }

            for i in self.iteration..message.iteration {
                let (message_key, next_chain) = advance_chain(&self.chain_key)?;
                self.chain_key = next_chain;
                self.cached_keys.insert(i, message_key);
            }
            self.iteration = message.iteration;
        }

        if message.iteration < self.iteration {
            // Behind the chain position with no cached key left, the key is gone for good.
            return Err(SenderKeyError::DecryptionFailed);
        }

        let (message_key, next_chain) = advance_chain(&self.chain_key)?;
        self.chain_key = next_chain;
        self.iteration += 1;

        decrypt_with_key(&message_key, message)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// KDF(chain_key) -> (message_key, next_chain_key).
fn advance_chain(chain_key: &Secret<32>) -> Result<(Secret<32>, Secret<32>), HkdfError> {
    let message_key: [u8; 32] = hkdf_sha256(Some(chain_key.as_bytes()), &[0x01], SENDER_KEY_INFO)?;
    let next_chain: [u8; 32] = hkdf_sha256(Some(chain_key.as_bytes()), &[0x02], SENDER_KEY_INFO)?;
    Ok((Secret::from_bytes(message_key), Secret::from_bytes(next_chain)))
}

fn decrypt_with_key(
    message_key: &Secret<32>,
    message: &SenderKeyMessage,
) -> Result<Vec<u8>, SenderKeyError> {
    aead_decrypt(
        message_key.as_bytes(),
        &message.nonce,
        &message.ciphertext,
        &[],
    )
    .map_err(SenderKeyError::from)
}

#[derive(Debug, Error)]
pub enum SenderKeyError {
    #[error("message belongs to unknown sender key chain {0}")]
    UnknownChain(u32),

    #[error("message is more than {MAX_SKIP} steps ahead of the receive chain")]
    TooManySkipped,

    #[error("message key was already consumed or never cached")]
    DecryptionFailed,

    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Rng(#[from] RngError),
}
