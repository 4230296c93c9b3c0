// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use serde::{Deserialize, Serialize};

use crate::crypto::Secret;
use crate::crypto::x25519::PublicKey;
use crate::key_bundle::{OneTimePrekeyId, SignedPrekeyId};

/// Locally persisted identity key pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub signing_key: Secret<32>,
    pub verifying_key: [u8; 32],
}

/// Locally persisted signed pre-key, including the private half.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPrekeyRecord {
    pub key_id: SignedPrekeyId,
    pub public_key: PublicKey,
    pub secret_key: Secret<32>,
}

/// Locally persisted one-time pre-key, including the private half.
///
/// Deleted the moment it services a handshake; it must never be used twice.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneTimePrekeyRecord {
    pub key_id: OneTimePrekeyId,
    pub public_key: PublicKey,
    pub secret_key: Secret<32>,
}

/// Entry of the decrypted-message cache.
///
/// The cache is a non-authoritative convenience: repeated decrypt calls (pagination, search)
/// return the cached plaintext instead of re-deriving ratchet state. It can be evicted freely.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedPlaintext {
    pub message_id: String,
    pub channel_id: String,
    pub content: String,
}

/// Durable key/value persistence for all cryptographic state.
///
/// Collections mirror the entities of the protocol: identity, pre-keys, pairwise sessions,
/// pinned peer identities, group chains and the decrypted-message cache. Serialized ratchet and
/// chain state is stored as opaque bytes; the engines own the encoding.
///
/// Implementations must make [`CryptoStore::take_onetime_prekey`] atomic with respect to
/// concurrent reads of the same id, and [`CryptoStore::clear_all`] atomic with respect to
/// concurrent reads (no partial state observable).
pub trait CryptoStore: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    // Identity.

    fn identity(&self) -> impl Future<Output = Result<Option<IdentityRecord>, Self::Error>> + Send;

    fn set_identity(
        &self,
        identity: IdentityRecord,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    // Key-schema version.

    fn key_version(&self) -> impl Future<Output = Result<Option<u32>, Self::Error>> + Send;

    fn set_key_version(&self, version: u32)
    -> impl Future<Output = Result<(), Self::Error>> + Send;

    // Signed pre-keys.

    fn signed_prekey(
        &self,
        key_id: SignedPrekeyId,
    ) -> impl Future<Output = Result<Option<SignedPrekeyRecord>, Self::Error>> + Send;

    fn set_signed_prekey(
        &self,
        prekey: SignedPrekeyRecord,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    // One-time pre-keys.

    fn set_onetime_prekeys(
        &self,
        prekeys: Vec<OneTimePrekeyRecord>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Removes and returns the one-time pre-key with the given id.
    ///
    /// Get-and-delete as a single step: this is the "consume" transaction which guarantees an
    /// one-time pre-key services at most one handshake.
    fn take_onetime_prekey(
        &self,
        key_id: OneTimePrekeyId,
    ) -> impl Future<Output = Result<Option<OneTimePrekeyRecord>, Self::Error>> + Send;

    /// Returns the highest locally known one-time pre-key id, or 0 when none exist.
    fn max_onetime_prekey_id(
        &self,
    ) -> impl Future<Output = Result<OneTimePrekeyId, Self::Error>> + Send;

    // Pairwise sessions.

    fn session(
        &self,
        peer_id: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    fn set_session(
        &self,
        peer_id: &str,
        state: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn delete_session(&self, peer_id: &str)
    -> impl Future<Output = Result<(), Self::Error>> + Send;

    // Pinned peer identities (trust-on-first-use).

    fn peer_identity(
        &self,
        peer_id: &str,
    ) -> impl Future<Output = Result<Option<[u8; 32]>, Self::Error>> + Send;

    fn set_peer_identity(
        &self,
        peer_id: &str,
        identity_key: [u8; 32],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    // Group send chains, one per channel.

    fn sender_chain(
        &self,
        channel_id: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    fn set_sender_chain(
        &self,
        channel_id: &str,
        state: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn delete_sender_chain(
        &self,
        channel_id: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    // Group receive chains, one per (channel, sender).

    fn receiver_chain(
        &self,
        channel_id: &str,
        sender_id: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    fn set_receiver_chain(
        &self,
        channel_id: &str,
        sender_id: &str,
        state: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Deletes the receive chains of _all_ senders in the given channel.
    fn delete_receiver_chains(
        &self,
        channel_id: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    // Decrypted-message cache.

    fn cached_plaintext(
        &self,
        message_id: &str,
    ) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send;

    fn cache_plaintext(
        &self,
        entry: CachedPlaintext,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Wipes every collection. Idempotent and callable at any point in the store's lifecycle.
    fn clear_all(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
