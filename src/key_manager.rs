// SPDX-License-Identifier: MIT OR Apache-2.0

//! Long-lived identity and pre-key management.
//!
//! Owns the local Ed25519 identity key, the signed pre-key and the one-time pre-key pool, and
//! keeps the server-side key directory in sync with them. Private halves are always persisted
//! before their public halves are advertised, so a crash between the two can never leave a
//! published key this device cannot use.
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::identity::generate_identity_key;
use crate::crypto::x25519::SecretKey;
use crate::crypto::{Rng, RngError, Secret};
use crate::key_bundle::{
    OneTimePrekeyId, OneTimePrekeyPublic, RegistrationKeys, SignedPrekeyPublic,
};
use crate::store::{CryptoStore, IdentityRecord, OneTimePrekeyRecord, SignedPrekeyRecord};
use crate::traits::KeyDirectory;

/// Version of the local key schema. Bumping it wipes and regenerates all local crypto state on
/// the next [`KeyManager::ensure_keys_registered`] call.
pub const KEY_VERSION: u32 = 2;

/// Id of the signed pre-key generated at registration.
pub const SIGNED_PREKEY_ID: u32 = 1;

/// Number of one-time pre-keys generated at registration.
pub const INITIAL_ONETIME_PREKEY_COUNT: u32 = 100;

/// Server-visible pool size below which replenishment kicks in.
pub const ONETIME_PREKEY_THRESHOLD: u32 = 25;

/// Number of one-time pre-keys added per replenishment.
pub const ONETIME_PREKEY_BATCH: u32 = 100;

/// Manages the local identity key, signed pre-key and one-time pre-key pool.
pub struct KeyManager<S, D> {
    store: Arc<S>,
    directory: Arc<D>,
    rng: Arc<Rng>,
}

impl<S, D> Clone for KeyManager<S, D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            directory: self.directory.clone(),
            rng: self.rng.clone(),
        }
    }
}

impl<S, D> KeyManager<S, D>
where
    S: CryptoStore,
    D: KeyDirectory,
{
    pub fn new(store: Arc<S>, directory: Arc<D>, rng: Arc<Rng>) -> Self {
        Self {
            store,
            directory,
            rng,
        }
    }

    /// Generates and persists a complete set of registration keys, returning the public halves
    /// for upload.
    ///
    /// All private material hits the store before this returns (persist-before-advertise).
    pub async fn generate_registration_keys(
        &self,
    ) -> Result<RegistrationKeys, KeyManagerError<S::Error, D::Error>> {
        let identity_key = generate_identity_key(&self.rng)?;

        let signed_prekey_secret = SecretKey::from_bytes(self.rng.random_array()?);
        let signed_prekey_public = signed_prekey_secret.public_key();
        let signature = identity_key.sign(signed_prekey_public.as_bytes());

        let mut onetime_records = Vec::with_capacity(INITIAL_ONETIME_PREKEY_COUNT as usize);
        let mut onetime_publics = Vec::with_capacity(INITIAL_ONETIME_PREKEY_COUNT as usize);
        for key_id in 1..=INITIAL_ONETIME_PREKEY_COUNT {
            let (record, public) = self.generate_onetime_prekey(key_id)?;
            onetime_records.push(record);
            onetime_publics.push(public);
        }

        self.store
            .set_identity(IdentityRecord {
                signing_key: Secret::from_bytes(identity_key.to_bytes()),
                verifying_key: identity_key.verifying_key().to_bytes(),
            })
            .await
            .map_err(KeyManagerError::Storage)?;
        self.store
            .set_signed_prekey(SignedPrekeyRecord {
                key_id: SIGNED_PREKEY_ID,
                public_key: signed_prekey_public,
                secret_key: Secret::from_bytes(*signed_prekey_secret.as_bytes()),
            })
            .await
            .map_err(KeyManagerError::Storage)?;
        self.store
            .set_onetime_prekeys(onetime_records)
            .await
            .map_err(KeyManagerError::Storage)?;

        Ok(RegistrationKeys {
            identity_key: identity_key.verifying_key().to_bytes(),
            signed_prekey: SignedPrekeyPublic {
                key_id: SIGNED_PREKEY_ID,
                public_key: signed_prekey_public,
                signature: signature.to_bytes().to_vec(),
            },
            one_time_prekeys: onetime_publics,
        })
    }

    /// Idempotent bootstrap, called at login.
    ///
    /// Generates and registers keys when none exist yet. A key-schema version mismatch wipes
    /// all local crypto state, sessions included, and re-registers from scratch; sessions are
    /// not salvageable across key versions.
    pub async fn ensure_keys_registered(&self) -> Result<(), KeyManagerError<S::Error, D::Error>> {
        let identity = self.store.identity().await.map_err(KeyManagerError::Storage)?;
        let version = self
            .store
            .key_version()
            .await
            .map_err(KeyManagerError::Storage)?;

        if identity.is_some() && version == Some(KEY_VERSION) {
            debug!("local keys are up to date (version {KEY_VERSION})");
            return Ok(());
        }

        if identity.is_some() {
            warn!(
                local_version = ?version,
                expected_version = KEY_VERSION,
                "key schema changed, wiping local crypto state and re-registering"
            );
            self.store
                .clear_all()
                .await
                .map_err(KeyManagerError::Storage)?;
        } else {
            info!("no local identity key, generating and registering keys");
        }

        let registration = self.generate_registration_keys().await?;
        self.directory
            .register_keys(&registration)
            .await
            .map_err(KeyManagerError::Upload)?;

        // Marks registration complete. Left unset on upload failure so the next call retries
        // from scratch.
        self.store
            .set_key_version(KEY_VERSION)
            .await
            .map_err(KeyManagerError::Storage)?;

        Ok(())
    }

    /// Tops up the server-side one-time pre-key pool when it runs low. Returns the number of
    /// pre-keys added.
    ///
    /// New ids continue from the local maximum, recomputed inside the call, so repeated or
    /// racing invocations never collide.
    pub async fn replenish_prekeys(&self) -> Result<u32, KeyManagerError<S::Error, D::Error>> {
        let remaining = self
            .directory
            .onetime_prekey_count()
            .await
            .map_err(KeyManagerError::Upload)?;
        if remaining >= ONETIME_PREKEY_THRESHOLD {
            debug!(remaining, "one-time pre-key pool is healthy");
            return Ok(0);
        }

        let next_id = self
            .store
            .max_onetime_prekey_id()
            .await
            .map_err(KeyManagerError::Storage)?
            + 1;

        let mut records = Vec::with_capacity(ONETIME_PREKEY_BATCH as usize);
        let mut publics = Vec::with_capacity(ONETIME_PREKEY_BATCH as usize);
        for key_id in next_id..next_id + ONETIME_PREKEY_BATCH {
            let (record, public) = self.generate_onetime_prekey(key_id)?;
            records.push(record);
            publics.push(public);
        }

        self.store
            .set_onetime_prekeys(records)
            .await
            .map_err(KeyManagerError::Storage)?;
        self.directory
            .upload_onetime_prekeys(&publics)
            .await
            .map_err(KeyManagerError::Upload)?;

        info!(
            count = ONETIME_PREKEY_BATCH,
            first_id = next_id,
            "replenished one-time pre-key pool"
        );

        Ok(ONETIME_PREKEY_BATCH)
    }

    /// The local identity signing key.
    pub async fn signing_key(&self) -> Result<SigningKey, KeyManagerError<S::Error, D::Error>> {
        let identity = self
            .store
            .identity()
            .await
            .map_err(KeyManagerError::Storage)?
            .ok_or(KeyManagerError::NotRegistered)?;
        Ok(SigningKey::from_bytes(identity.signing_key.as_bytes()))
    }

    /// The local identity public key.
    pub async fn verifying_key(&self) -> Result<VerifyingKey, KeyManagerError<S::Error, D::Error>> {
        Ok(self.signing_key().await?.verifying_key())
    }

    fn generate_onetime_prekey(
        &self,
        key_id: OneTimePrekeyId,
    ) -> Result<(OneTimePrekeyRecord, OneTimePrekeyPublic), RngError> {
        let secret = SecretKey::from_bytes(self.rng.random_array()?);
        let public_key = secret.public_key();

        let record = OneTimePrekeyRecord {
            key_id,
            public_key,
            secret_key: Secret::from_bytes(*secret.as_bytes()),
        };
        let public = OneTimePrekeyPublic { key_id, public_key };

        Ok((record, public))
    }
}

#[derive(Debug, Error)]
pub enum KeyManagerError<SE, DE> {
    #[error("crypto store failed: {0}")]
    Storage(SE),

    #[error("key upload to directory failed: {0}")]
    Upload(DE),

    #[error("no identity key registered yet")]
    NotRegistered,

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::crypto::Rng;
    use crate::store::{CryptoStore, MemoryStore};
    use crate::test_utils::TestServer;

    use super::{
        INITIAL_ONETIME_PREKEY_COUNT, KEY_VERSION, KeyManager, KeyManagerError,
        ONETIME_PREKEY_BATCH, SIGNED_PREKEY_ID,
    };

    fn key_manager(server: &TestServer, user_id: &str) -> (KeyManager<MemoryStore, crate::test_utils::TestDirectory>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(server.as_user(user_id));
        let rng = Arc::new(Rng::from_seed([1; 32]));
        (KeyManager::new(store.clone(), directory, rng), store)
    }

    #[tokio::test]
    async fn registration_persists_before_returning() {
        let server = TestServer::new();
        let (manager, store) = key_manager(&server, "panda");

        let registration = manager.generate_registration_keys().await.unwrap();

        assert_eq!(registration.signed_prekey.key_id, SIGNED_PREKEY_ID);
        assert_eq!(
            registration.one_time_prekeys.len(),
            INITIAL_ONETIME_PREKEY_COUNT as usize
        );

        // Private halves are already on disk.
        let identity = store.identity().await.unwrap().unwrap();
        assert_eq!(identity.verifying_key, registration.identity_key);
        assert!(store.signed_prekey(SIGNED_PREKEY_ID).await.unwrap().is_some());
        assert_eq!(
            store.max_onetime_prekey_id().await.unwrap(),
            INITIAL_ONETIME_PREKEY_COUNT
        );
    }

    #[tokio::test]
    async fn ensure_keys_registered_is_idempotent() {
        let server = TestServer::new();
        let (manager, store) = key_manager(&server, "panda");

        manager.ensure_keys_registered().await.unwrap();
        let identity_before = store.identity().await.unwrap().unwrap();
        assert_eq!(store.key_version().await.unwrap(), Some(KEY_VERSION));

        // Second call leaves the identity untouched.
        manager.ensure_keys_registered().await.unwrap();
        let identity_after = store.identity().await.unwrap().unwrap();
        assert_eq!(identity_before.verifying_key, identity_after.verifying_key);
    }

    #[tokio::test]
    async fn version_mismatch_wipes_and_regenerates() {
        let server = TestServer::new();
        let (manager, store) = key_manager(&server, "panda");

        manager.ensure_keys_registered().await.unwrap();
        let identity_before = store.identity().await.unwrap().unwrap();

        // Session state from an older key schema.
        store.set_session("icebear", vec![1, 2, 3]).await.unwrap();
        store.set_key_version(KEY_VERSION - 1).await.unwrap();

        manager.ensure_keys_registered().await.unwrap();

        let identity_after = store.identity().await.unwrap().unwrap();
        assert_ne!(identity_before.verifying_key, identity_after.verifying_key);
        assert!(store.session("icebear").await.unwrap().is_none());
        assert_eq!(store.key_version().await.unwrap(), Some(KEY_VERSION));
    }

    #[tokio::test]
    async fn upload_failure_leaves_registration_incomplete() {
        let server = TestServer::new();
        let (manager, store) = key_manager(&server, "panda");

        server.set_fail_uploads(true);
        assert!(matches!(
            manager.ensure_keys_registered().await,
            Err(KeyManagerError::Upload(_))
        ));
        assert_eq!(store.key_version().await.unwrap(), None);

        // Retry succeeds once the directory is reachable again.
        server.set_fail_uploads(false);
        manager.ensure_keys_registered().await.unwrap();
        assert_eq!(store.key_version().await.unwrap(), Some(KEY_VERSION));
    }

    #[tokio::test]
    async fn replenish_tops_up_low_pool() {
        let server = TestServer::new();
        let (manager, store) = key_manager(&server, "panda");
        manager.ensure_keys_registered().await.unwrap();

        // Healthy pool, nothing to do.
        assert_eq!(manager.replenish_prekeys().await.unwrap(), 0);

        server.drain_onetime_prekeys("panda", INITIAL_ONETIME_PREKEY_COUNT - 5);
        assert_eq!(
            manager.replenish_prekeys().await.unwrap(),
            ONETIME_PREKEY_BATCH
        );

        // Ids continue from the local maximum.
        assert_eq!(
            store.max_onetime_prekey_id().await.unwrap(),
            INITIAL_ONETIME_PREKEY_COUNT + ONETIME_PREKEY_BATCH
        );
    }

    #[tokio::test]
    async fn keys_unavailable_before_registration() {
        let server = TestServer::new();
        let (manager, _) = key_manager(&server, "panda");

        assert!(matches!(
            manager.signing_key().await,
            Err(KeyManagerError::NotRegistered)
        ));
    }
}
