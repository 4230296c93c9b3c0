// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory persistence for cryptographic state.
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::key_bundle::{OneTimePrekeyId, SignedPrekeyId};
use crate::store::traits::{
    CachedPlaintext, CryptoStore, IdentityRecord, OneTimePrekeyRecord, SignedPrekeyRecord,
};

#[derive(Debug, Default)]
pub struct InnerMemoryStore {
    identity: Option<IdentityRecord>,
    key_version: Option<u32>,
    signed_prekeys: BTreeMap<SignedPrekeyId, SignedPrekeyRecord>,
    onetime_prekeys: BTreeMap<OneTimePrekeyId, OneTimePrekeyRecord>,
    sessions: HashMap<String, Vec<u8>>,
    peer_identities: HashMap<String, [u8; 32]>,
    sender_chains: HashMap<String, Vec<u8>>,
    receiver_chains: HashMap<(String, String), Vec<u8>>,
    decrypted_messages: HashMap<String, CachedPlaintext>,
}

/// An in-memory [`CryptoStore`].
///
/// `MemoryStore` supports usage in asynchronous and multi-threaded contexts by wrapping an
/// `InnerMemoryStore` with an `RwLock` and `Arc`. All operations, `clear_all` included, hold the
/// lock for their full duration, so no partial state is ever observable.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<InnerMemoryStore>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_store(&self) -> RwLockReadGuard<'_, InnerMemoryStore> {
        self.inner
            .read()
            .expect("acquire shared read access on store")
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, InnerMemoryStore> {
        self.inner
            .write()
            .expect("acquire exclusive write access on store")
    }
}

impl CryptoStore for MemoryStore {
    type Error = Infallible;

    async fn identity(&self) -> Result<Option<IdentityRecord>, Self::Error> {
        Ok(self.read_store().identity.clone())
    }

    async fn set_identity(&self, identity: IdentityRecord) -> Result<(), Self::Error> {
        self.write_store().identity = Some(identity);
        Ok(())
    }

    async fn key_version(&self) -> Result<Option<u32>, Self::Error> {
        Ok(self.read_store().key_version)
    }

    async fn set_key_version(&self, version: u32) -> Result<(), Self::Error> {
        self.write_store().key_version = Some(version);
        Ok(())
    }

    async fn signed_prekey(
        &self,
        key_id: SignedPrekeyId,
    ) -> Result<Option<SignedPrekeyRecord>, Self::Error> {
        Ok(self.read_store().signed_prekeys.get(&key_id).cloned())
    }

    async fn set_signed_prekey(&self, prekey: SignedPrekeyRecord) -> Result<(), Self::Error> {
        self.write_store()
            .signed_prekeys
            .insert(prekey.key_id, prekey);
        Ok(())
    }

    async fn set_onetime_prekeys(
        &self,
        prekeys: Vec<OneTimePrekeyRecord>,
    ) -> Result<(), Self::Error> {
        let mut store = self.write_store();
        for prekey in prekeys {
            store.onetime_prekeys.insert(prekey.key_id, prekey);
        }
        Ok(())
    }

    async fn take_onetime_prekey(
        &self,
        key_id: OneTimePrekeyId,
    ) -> Result<Option<OneTimePrekeyRecord>, Self::Error> {
        Ok(self.write_store().onetime_prekeys.remove(&key_id))
    }

    async fn max_onetime_prekey_id(&self) -> Result<OneTimePrekeyId, Self::Error> {
        Ok(self
            .read_store()
            .onetime_prekeys
            .last_key_value()
            .map(|(key_id, _)| *key_id)
            .unwrap_or(0))
    }

    async fn session(&self, peer_id: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.read_store().sessions.get(peer_id).cloned())
    }

    async fn set_session(&self, peer_id: &str, state: Vec<u8>) -> Result<(), Self::Error> {
        self.write_store().sessions.insert(peer_id.to_owned(), state);
        Ok(())
    }

    async fn delete_session(&self, peer_id: &str) -> Result<(), Self::Error> {
        self.write_store().sessions.remove(peer_id);
        Ok(())
    }

    async fn peer_identity(&self, peer_id: &str) -> Result<Option<[u8; 32]>, Self::Error> {
        Ok(self.read_store().peer_identities.get(peer_id).copied())
    }

    async fn set_peer_identity(
        &self,
        peer_id: &str,
        identity_key: [u8; 32],
    ) -> Result<(), Self::Error> {
        self.write_store()
            .peer_identities
            .insert(peer_id.to_owned(), identity_key);
        Ok(())
    }

    async fn sender_chain(&self, channel_id: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.read_store().sender_chains.get(channel_id).cloned())
    }

    async fn set_sender_chain(&self, channel_id: &str, state: Vec<u8>) -> Result<(), Self::Error> {
        self.write_store()
            .sender_chains
            .insert(channel_id.to_owned(), state);
        Ok(())
    }

    async fn delete_sender_chain(&self, channel_id: &str) -> Result<(), Self::Error> {
        self.write_store().sender_chains.remove(channel_id);
        Ok(())
    }

    async fn receiver_chain(
        &self,
        channel_id: &str,
        sender_id: &str,
    ) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self
            .read_store()
            .receiver_chains
            .get(&(channel_id.to_owned(), sender_id.to_owned()))
            .cloned())
    }

    async fn set_receiver_chain(
        &self,
        channel_id: &str,
        sender_id: &str,
        state: Vec<u8>,
    ) -> Result<(), Self::Error> {
        self.write_store()
            .receiver_chains
            .insert((channel_id.to_owned(), sender_id.to_owned()), state);
        Ok(())
    }

    async fn delete_receiver_chains(&self, channel_id: &str) -> Result<(), Self::Error> {
        self.write_store()
            .receiver_chains
            .retain(|(channel, _), _| channel != channel_id);
        Ok(())
    }

    async fn cached_plaintext(&self, message_id: &str) -> Result<Option<String>, Self::Error> {
        Ok(self
            .read_store()
            .decrypted_messages
            .get(message_id)
            .map(|entry| entry.content.clone()))
    }

    async fn cache_plaintext(&self, entry: CachedPlaintext) -> Result<(), Self::Error> {
        self.write_store()
            .decrypted_messages
            .insert(entry.message_id.clone(), entry);
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), Self::Error> {
        let mut store = self.write_store();
        *store = InnerMemoryStore::default();
        Ok(())
    }
}
