// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process fake of the server-side key directory.
//!
//! A single [`TestServer`] plays the remote directory for any number of simulated users; each
//! user talks to it through their own [`TestDirectory`] handle, exactly like each client talks
//! to the real server with their own credentials.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::group::SenderKeyDistribution;
use crate::key_bundle::{
    OneTimePrekeyId, OneTimePrekeyPublic, PrekeyBundle, RegistrationKeys, SignedPrekeyPublic,
};
use crate::traits::{KeyDirectory, RemoteDistribution, SenderKeyDirectory};

#[derive(Debug)]
struct UserKeys {
    identity_key: [u8; 32],
    signed_prekey: SignedPrekeyPublic,
    onetime_prekeys: BTreeMap<OneTimePrekeyId, OneTimePrekeyPublic>,
}

#[derive(Debug, Default)]
struct ServerState {
    users: HashMap<String, UserKeys>,

    // channel id -> sender id -> distribution.
    distributions: HashMap<String, HashMap<String, RemoteDistribution>>,

    fail_uploads: bool,
}

/// Simulated server holding the published key material of all test users.
#[derive(Clone, Debug, Default)]
pub struct TestServer {
    state: Arc<RwLock<ServerState>>,
}

impl TestServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A directory handle acting on behalf of the given user.
    pub fn as_user(&self, user_id: &str) -> TestDirectory {
        TestDirectory {
            state: self.state.clone(),
            user_id: user_id.to_owned(),
        }
    }

    /// Makes every subsequent upload fail until reset, simulating an unreachable server.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.write().fail_uploads = fail;
    }

    /// Removes one-time pre-keys from a user's pool, simulating peers consuming them.
    pub fn drain_onetime_prekeys(&self, user_id: &str, count: u32) {
        let mut state = self.write();
        if let Some(user) = state.users.get_mut(user_id) {
            for _ in 0..count {
                if user.onetime_prekeys.pop_first().is_none() {
                    break;
                }
            }
        }
    }

    /// All current distributions of a channel, as any member would fetch them.
    pub fn distributions_for(&self, channel_id: &str) -> Vec<RemoteDistribution> {
        self.read()
            .distributions
            .get(channel_id)
            .map(|senders| senders.values().cloned().collect())
            .unwrap_or_default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ServerState> {
        self.state.read().expect("acquire read access on test server")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ServerState> {
        self.state.write().expect("acquire write access on test server")
    }
}

/// One user's view of the [`TestServer`].
#[derive(Clone, Debug)]
pub struct TestDirectory {
    state: Arc<RwLock<ServerState>>,
    user_id: String,
}

impl TestDirectory {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, ServerState> {
        self.state.read().expect("acquire read access on test server")
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, ServerState>, TestDirectoryError> {
        let state = self.state.write().expect("acquire write access on test server");
        if state.fail_uploads {
            return Err(TestDirectoryError::Unavailable);
        }
        Ok(state)
    }
}

impl KeyDirectory for TestDirectory {
    type Error = TestDirectoryError;

    async fn register_keys(&self, keys: &RegistrationKeys) -> Result<(), Self::Error> {
        let mut state = self.write()?;
        state.users.insert(
            self.user_id.clone(),
            UserKeys {
                identity_key: keys.identity_key,
                signed_prekey: keys.signed_prekey.clone(),
                onetime_prekeys: keys
                    .one_time_prekeys
                    .iter()
                    .map(|prekey| (prekey.key_id, prekey.clone()))
                    .collect(),
            },
        );
        Ok(())
    }

    async fn key_bundle(&self, peer_id: &str) -> Result<Option<PrekeyBundle>, Self::Error> {
        let mut state = self.state.write().expect("acquire write access on test server");
        let Some(user) = state.users.get_mut(peer_id) else {
            return Ok(None);
        };

        // The directory hands out each one-time pre-key exactly once.
        let one_time_prekey = user.onetime_prekeys.pop_first().map(|(_, prekey)| prekey);

        Ok(Some(PrekeyBundle {
            identity_key: user.identity_key,
            signed_prekey: user.signed_prekey.clone(),
            one_time_prekey,
        }))
    }

    async fn upload_onetime_prekeys(
        &self,
        prekeys: &[OneTimePrekeyPublic],
    ) -> Result<(), Self::Error> {
        let mut state = self.write()?;
        let Some(user) = state.users.get_mut(&self.user_id) else {
            return Err(TestDirectoryError::Unavailable);
        };
        for prekey in prekeys {
            user.onetime_prekeys.insert(prekey.key_id, prekey.clone());
        }
        Ok(())
    }

    async fn onetime_prekey_count(&self) -> Result<u32, Self::Error> {
        Ok(self
            .read()
            .users
            .get(&self.user_id)
            .map(|user| user.onetime_prekeys.len() as u32)
            .unwrap_or(0))
    }
}

impl SenderKeyDirectory for TestDirectory {
    type Error = TestDirectoryError;

    async fn upload_distribution(
        &self,
        channel_id: &str,
        distribution: &SenderKeyDistribution,
    ) -> Result<(), Self::Error> {
        let mut state = self.write()?;
        state
            .distributions
            .entry(channel_id.to_owned())
            .or_default()
            .insert(
                self.user_id.clone(),
                RemoteDistribution {
                    sender_id: self.user_id.clone(),
                    chain_id: distribution.chain_id,
                    distribution: distribution.clone(),
                },
            );
        Ok(())
    }

    async fn distributions(&self, channel_id: &str) -> Result<Vec<RemoteDistribution>, Self::Error> {
        Ok(self
            .read()
            .distributions
            .get(channel_id)
            .map(|senders| senders.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Error)]
pub enum TestDirectoryError {
    #[error("test directory is unavailable")]
    Unavailable,
}
