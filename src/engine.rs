// SPDX-License-Identifier: MIT OR Apache-2.0

//! Top-level protocol engine tying key management and both session engines together.
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::crypto::Rng;
use crate::events::SecurityEvent;
use crate::group::GroupSessionManager;
use crate::key_manager::KeyManager;
use crate::store::CryptoStore;
use crate::traits::{KeyDirectory, SenderKeyDirectory};
use crate::two_party::SessionManager;

/// Capacity of the security event channel. Slow subscribers lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One logical crypto session of one user.
///
/// Owns the key manager, the pairwise session engine and the group session engine over a shared
/// store, directory and random number generator. There is no global state; tests and multi
/// account setups construct as many engines as they need, each fully independent.
pub struct Engine<S, D> {
    store: Arc<S>,
    key_manager: KeyManager<S, D>,
    sessions: SessionManager<S, D>,
    groups: GroupSessionManager<S, D>,
    events: broadcast::Sender<SecurityEvent>,
}

impl<S, D> Engine<S, D>
where
    S: CryptoStore,
    D: KeyDirectory + SenderKeyDirectory,
{
    pub fn new(user_id: impl Into<String>, store: S, directory: D) -> Self {
        Self::with_rng(user_id, store, directory, Rng::default())
    }

    pub fn with_rng(user_id: impl Into<String>, store: S, directory: D, rng: Rng) -> Self {
        let store = Arc::new(store);
        let directory = Arc::new(directory);
        let rng = Arc::new(rng);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let key_manager = KeyManager::new(store.clone(), directory.clone(), rng.clone());
        let sessions = SessionManager::new(
            store.clone(),
            directory.clone(),
            rng.clone(),
            key_manager.clone(),
            events.clone(),
        );
        let groups = GroupSessionManager::new(store.clone(), directory, rng, user_id.into());

        Self {
            store,
            key_manager,
            sessions,
            groups,
            events,
        }
    }

    /// Identity and pre-key management.
    pub fn key_manager(&self) -> &KeyManager<S, D> {
        &self.key_manager
    }

    /// Direct-message encryption.
    pub fn sessions(&self) -> &SessionManager<S, D> {
        &self.sessions
    }

    /// Group channel encryption.
    pub fn groups(&self) -> &GroupSessionManager<S, D> {
        &self.groups
    }

    /// Subscribes to security events such as [`SecurityEvent::IdentityKeyChanged`].
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events.subscribe()
    }

    /// Tops up the one-time pre-key pool when the directory reports it low.
    ///
    /// Replenishment is opportunistic housekeeping; a failure here never blocks messaging, the
    /// error is logged and the next invocation retries. Callers that need the typed result use
    /// [`KeyManager::replenish_prekeys`] directly.
    pub async fn replenish_prekeys(&self) {
        if let Err(err) = self.key_manager.replenish_prekeys().await {
            warn!(error = %err, "failed to replenish one-time pre-key pool");
        }
    }

    /// Wipes all local cryptographic state, called at logout.
    ///
    /// Drains in-flight operations by taking every per-peer and per-channel lock before
    /// clearing the store, so no encrypt or decrypt call observes partial state.
    pub async fn wipe(&self) -> Result<(), S::Error> {
        let _peer_guards = self.sessions.acquire_all_locks().await;
        let _channel_guards = self.groups.acquire_all_locks().await;
        self.store.clear_all().await
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::key_manager::{
        INITIAL_ONETIME_PREKEY_COUNT, KeyManagerError, ONETIME_PREKEY_BATCH,
    };
    use crate::store::MemoryStore;
    use crate::test_utils::{TestDirectory, TestServer};
    use crate::traits::KeyDirectory;

    use super::Engine;

    fn engine(server: &TestServer, user_id: &str, seed: u8) -> Engine<MemoryStore, TestDirectory> {
        Engine::with_rng(
            user_id,
            MemoryStore::new(),
            server.as_user(user_id),
            Rng::from_seed([seed; 32]),
        )
    }

    #[tokio::test]
    async fn full_direct_message_flow() {
        let server = TestServer::new();
        let alice = engine(&server, "alice", 1);
        let bob = engine(&server, "bob", 2);

        alice.key_manager().ensure_keys_registered().await.unwrap();
        bob.key_manager().ensure_keys_registered().await.unwrap();

        let wire = alice.sessions().encrypt_for_peer("bob", "hi").await.unwrap();
        assert_eq!(
            bob.sessions().decrypt_from_peer("alice", &wire).await.unwrap(),
            "hi"
        );

        let reply = bob.sessions().encrypt_for_peer("alice", "hey").await.unwrap();
        assert_eq!(
            alice.sessions().decrypt_from_peer("bob", &reply).await.unwrap(),
            "hey"
        );
    }

    #[tokio::test]
    async fn full_group_flow() {
        let server = TestServer::new();
        let alice = engine(&server, "alice", 3);
        let bob = engine(&server, "bob", 4);
        let carol = engine(&server, "carol", 5);

        let wire = alice
            .groups()
            .encrypt_for_group("channel-1", "hello everyone")
            .await
            .unwrap();

        assert_eq!(
            bob.groups()
                .decrypt_group_message("channel-1", "alice", &wire, None)
                .await
                .unwrap(),
            "hello everyone"
        );
        assert_eq!(
            carol
                .groups()
                .decrypt_group_message("channel-1", "alice", &wire, None)
                .await
                .unwrap(),
            "hello everyone"
        );
    }

    #[tokio::test]
    async fn replenish_absorbs_directory_failures() {
        let server = TestServer::new();
        let alice = engine(&server, "alice", 10);
        alice.key_manager().ensure_keys_registered().await.unwrap();

        let directory = server.as_user("alice");
        let drained = INITIAL_ONETIME_PREKEY_COUNT - 10;
        server.drain_onetime_prekeys("alice", drained);

        // An unreachable directory is logged and swallowed, the pool stays untouched.
        server.set_fail_uploads(true);
        alice.replenish_prekeys().await;
        assert_eq!(directory.onetime_prekey_count().await.unwrap(), 10);

        // The next invocation retries and tops the pool up.
        server.set_fail_uploads(false);
        alice.replenish_prekeys().await;
        assert_eq!(
            directory.onetime_prekey_count().await.unwrap(),
            10 + ONETIME_PREKEY_BATCH
        );
    }

    #[tokio::test]
    async fn wipe_clears_everything() {
        let server = TestServer::new();
        let alice = engine(&server, "alice", 6);
        let bob = engine(&server, "bob", 7);

        alice.key_manager().ensure_keys_registered().await.unwrap();
        bob.key_manager().ensure_keys_registered().await.unwrap();

        alice.sessions().encrypt_for_peer("bob", "hi").await.unwrap();
        assert!(alice.sessions().has_session("bob").await.unwrap());

        alice.wipe().await.unwrap();

        assert!(!alice.sessions().has_session("bob").await.unwrap());
        assert!(matches!(
            alice.key_manager().signing_key().await,
            Err(KeyManagerError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn engines_are_independent() {
        let server_1 = TestServer::new();
        let server_2 = TestServer::new();

        // Same user id on two separate servers; nothing leaks between the engines.
        let alice_1 = engine(&server_1, "alice", 8);
        let alice_2 = engine(&server_2, "alice", 9);

        alice_1.key_manager().ensure_keys_registered().await.unwrap();
        alice_2.key_manager().ensure_keys_registered().await.unwrap();

        let key_1 = alice_1.key_manager().verifying_key().await.unwrap();
        let key_2 = alice_2.key_manager().verifying_key().await.unwrap();
        assert_ne!(key_1, key_2);
    }
}
