// SPDX-License-Identifier: MIT OR Apache-2.0

//! Group session engine: Sender-Key encryption for multi-member channels.
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{Rng, RngError};
use crate::group::sender_keys::{
    ReceiverChain, SenderChain, SenderKeyDistribution, SenderKeyError,
};
use crate::lock_map::LockMap;
use crate::store::{CachedPlaintext, CryptoStore};
use crate::traits::SenderKeyDirectory;
use crate::wire::{Envelope, GroupWireMessage};

/// Encrypts and decrypts group channel messages.
///
/// One send chain per channel, one receive chain per (channel, sender). All operations for the
/// same channel are serialized through a per-channel mutex, which also makes rotation atomic
/// with respect to in-flight sends.
pub struct GroupSessionManager<S, D> {
    store: Arc<S>,
    directory: Arc<D>,
    rng: Arc<Rng>,

    /// Local user id, announced as the sender of our distributions.
    user_id: String,

    channel_locks: LockMap,
}

impl<S, D> GroupSessionManager<S, D>
where
    S: CryptoStore,
    D: SenderKeyDirectory,
{
    pub fn new(store: Arc<S>, directory: Arc<D>, rng: Arc<Rng>, user_id: String) -> Self {
        Self {
            store,
            directory,
            rng,
            user_id,
            channel_locks: LockMap::default(),
        }
    }

    /// Encrypts a message for all members of a channel.
    ///
    /// A missing send chain is generated on the spot and its distribution uploaded before any
    /// local state is persisted. Persisting first would let this device encrypt with a chain no
    /// other member can ever derive; upload failure therefore aborts the send with the store
    /// untouched, and a retry starts from scratch.
    pub async fn encrypt_for_group(
        &self,
        channel_id: &str,
        plaintext: &str,
    ) -> Result<Vec<u8>, GroupSessionError<S::Error, D::Error>> {
        let _guard = self.channel_locks.lock(channel_id).await;

        let chain_bytes = self
            .store
            .sender_chain(channel_id)
            .await
            .map_err(GroupSessionError::Storage)?;

        let mut chain = match chain_bytes {
            Some(bytes) => SenderChain::from_bytes(&bytes)?,
            None => {
                let (chain, distribution) = SenderChain::generate(&self.rng, &self.user_id)?;
                self.directory
                    .upload_distribution(channel_id, &distribution)
                    .await
                    .map_err(GroupSessionError::UploadFailed)?;
                info!(
                    %channel_id,
                    chain_id = chain.chain_id(),
                    "created sender key chain and uploaded distribution"
                );
                chain
            }
        };

        let message = chain.encrypt(&self.rng, plaintext.as_bytes())?;
        self.store
            .set_sender_chain(channel_id, chain.to_bytes()?)
            .await
            .map_err(GroupSessionError::Storage)?;

        Ok(serde_json::to_vec(&GroupWireMessage::new(message))?)
    }

    /// Decrypts a group message from a given sender.
    ///
    /// Non-envelope content and envelopes of a foreign version fall back to UTF-8 decoding. A
    /// missing receive chain is derived
    /// from the sender's published distribution; a chain id mismatch refetches the distribution
    /// once, the sender may have rotated.
    pub async fn decrypt_group_message(
        &self,
        channel_id: &str,
        sender_id: &str,
        bytes: &[u8],
        message_id: Option<&str>,
    ) -> Result<String, GroupSessionError<S::Error, D::Error>> {
        if let Some(message_id) = message_id {
            let cached = self
                .store
                .cached_plaintext(message_id)
                .await
                .map_err(GroupSessionError::Storage)?;
            if let Some(plaintext) = cached {
                return Ok(plaintext);
            }
        }

        let wire = match Envelope::parse(bytes) {
            Envelope::Group(wire) => wire,
            Envelope::Unsupported(version) => {
                // Not ours to decrypt, likely written by a newer client.
                debug!(%channel_id, %sender_id, version, "foreign envelope version, passing content through");
                return Ok(String::from_utf8_lossy(bytes).into_owned());
            }
            Envelope::Pairwise(_) | Envelope::Legacy => {
                return Ok(String::from_utf8_lossy(bytes).into_owned());
            }
        };

        let _guard = self.channel_locks.lock(channel_id).await;

        let mut chain = match self
            .store
            .receiver_chain(channel_id, sender_id)
            .await
            .map_err(GroupSessionError::Storage)?
        {
            Some(chain_bytes) => ReceiverChain::from_bytes(&chain_bytes)?,
            None => self.fetch_receiver_chain(channel_id, sender_id).await?,
        };

        let plaintext = match chain.decrypt(&wire.message) {
            Ok(plaintext) => plaintext,
            Err(SenderKeyError::UnknownChain(chain_id)) => {
                // The sender rotated since we derived this chain. Refetch their current
                // distribution once and retry.
                debug!(
                    %channel_id,
                    %sender_id,
                    chain_id,
                    "chain id mismatch, refetching sender key distribution"
                );
                chain = self.fetch_receiver_chain(channel_id, sender_id).await?;
                chain.decrypt(&wire.message)?
            }
            Err(err) => {
                warn!(%channel_id, %sender_id, error = %err, "failed to decrypt group message");
                return Err(err.into());
            }
        };

        self.store
            .set_receiver_chain(channel_id, sender_id, chain.to_bytes()?)
            .await
            .map_err(GroupSessionError::Storage)?;

        let plaintext = String::from_utf8_lossy(&plaintext).into_owned();
        if let Some(message_id) = message_id {
            self.store
                .cache_plaintext(CachedPlaintext {
                    message_id: message_id.to_owned(),
                    channel_id: channel_id.to_owned(),
                    content: plaintext.clone(),
                })
                .await
                .map_err(GroupSessionError::Storage)?;
        }

        Ok(plaintext)
    }

    /// Discards the local send chain and every receive chain of a channel.
    ///
    /// Invoked when membership shrinks; a removed member must not be able to derive keys for
    /// anything sent afterwards. The next send regenerates and redistributes.
    pub async fn rotate_sender_keys(
        &self,
        channel_id: &str,
    ) -> Result<(), GroupSessionError<S::Error, D::Error>> {
        let _guard = self.channel_locks.lock(channel_id).await;

        self.store
            .delete_sender_chain(channel_id)
            .await
            .map_err(GroupSessionError::Storage)?;
        self.store
            .delete_receiver_chains(channel_id)
            .await
            .map_err(GroupSessionError::Storage)?;

        info!(%channel_id, "rotated sender keys");
        Ok(())
    }

    /// Derives and persists a receive chain from a distribution delivered out-of-band,
    /// replacing any prior chain for that sender.
    pub async fn process_sender_key_distribution(
        &self,
        channel_id: &str,
        sender_id: &str,
        distribution: &SenderKeyDistribution,
    ) -> Result<(), GroupSessionError<S::Error, D::Error>> {
        let _guard = self.channel_locks.lock(channel_id).await;

        let chain = ReceiverChain::from_distribution(distribution);
        self.store
            .set_receiver_chain(channel_id, sender_id, chain.to_bytes()?)
            .await
            .map_err(GroupSessionError::Storage)
    }

    pub(crate) async fn acquire_all_locks(&self) -> Vec<tokio::sync::OwnedMutexGuard<()>> {
        self.channel_locks.lock_all().await
    }

    /// Fetches the sender's current distribution and derives a receive chain from it. Does not
    /// persist; callers do that once decryption succeeded.
    async fn fetch_receiver_chain(
        &self,
        channel_id: &str,
        sender_id: &str,
    ) -> Result<ReceiverChain, GroupSessionError<S::Error, D::Error>> {
        let distributions = self
            .directory
            .distributions(channel_id)
            .await
            .map_err(GroupSessionError::Directory)?;

        let remote = distributions
            .into_iter()
            .find(|remote| remote.sender_id == sender_id)
            .ok_or_else(|| GroupSessionError::NoSenderKey(sender_id.to_owned()))?;

        Ok(ReceiverChain::from_distribution(&remote.distribution))
    }
}

#[derive(Debug, Error)]
pub enum GroupSessionError<SE, DE> {
    #[error("crypto store failed: {0}")]
    Storage(SE),

    #[error("sender key directory request failed: {0}")]
    Directory(DE),

    #[error("sender key distribution upload failed: {0}")]
    UploadFailed(DE),

    #[error("no sender key distribution available for sender {0}")]
    NoSenderKey(String),

    #[error(transparent)]
    SenderKey(#[from] SenderKeyError),

    #[error("wire message encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::crypto::Rng;
    use crate::store::{CryptoStore, MemoryStore};
    use crate::test_utils::{TestDirectory, TestServer};
    use crate::wire::Envelope;

    use super::{GroupSessionError, GroupSessionManager};

    struct TestMember {
        groups: GroupSessionManager<MemoryStore, TestDirectory>,
        store: Arc<MemoryStore>,
    }

    fn test_member(server: &TestServer, user_id: &str, seed: u8) -> TestMember {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(server.as_user(user_id));
        let rng = Arc::new(Rng::from_seed([seed; 32]));
        TestMember {
            groups: GroupSessionManager::new(store.clone(), directory, rng, user_id.to_owned()),
            store,
        }
    }

    #[tokio::test]
    async fn fan_out_to_all_members() {
        let server = TestServer::new();
        let alice = test_member(&server, "alice", 1);
        let bob = test_member(&server, "bob", 2);
        let carol = test_member(&server, "carol", 3);

        let wire = alice
            .groups
            .encrypt_for_group("channel-1", "hello everyone")
            .await
            .unwrap();

        // Both members derive their receive chain from Alice's uploaded distribution.
        assert_eq!(
            bob.groups
                .decrypt_group_message("channel-1", "alice", &wire, None)
                .await
                .unwrap(),
            "hello everyone"
        );
        assert_eq!(
            carol
                .groups
                .decrypt_group_message("channel-1", "alice", &wire, None)
                .await
                .unwrap(),
            "hello everyone"
        );
    }

    #[tokio::test]
    async fn send_chain_is_reused_within_channel() {
        let server = TestServer::new();
        let alice = test_member(&server, "alice", 4);
        let bob = test_member(&server, "bob", 5);

        for i in 0..5 {
            let text = format!("message {i}");
            let wire = alice.groups.encrypt_for_group("channel-1", &text).await.unwrap();
            assert_eq!(
                bob.groups
                    .decrypt_group_message("channel-1", "alice", &wire, None)
                    .await
                    .unwrap(),
                text
            );
        }
    }

    #[tokio::test]
    async fn upload_failure_aborts_send_without_local_state() {
        let server = TestServer::new();
        let alice = test_member(&server, "alice", 6);

        server.set_fail_uploads(true);
        assert!(matches!(
            alice.groups.encrypt_for_group("channel-1", "hi").await,
            Err(GroupSessionError::UploadFailed(_))
        ));
        assert!(alice.store.sender_chain("channel-1").await.unwrap().is_none());

        // Retry succeeds and members can decrypt, no stale chain was left behind.
        server.set_fail_uploads(false);
        let wire = alice.groups.encrypt_for_group("channel-1", "hi").await.unwrap();
        let bob = test_member(&server, "bob", 7);
        assert_eq!(
            bob.groups
                .decrypt_group_message("channel-1", "alice", &wire, None)
                .await
                .unwrap(),
            "hi"
        );
    }

    #[tokio::test]
    async fn rotation_invalidates_old_distribution() {
        let server = TestServer::new();
        let alice = test_member(&server, "alice", 8);
        let bob = test_member(&server, "bob", 9);
        let mallory = test_member(&server, "mallory", 10);

        let before = alice.groups.encrypt_for_group("channel-1", "with mallory").await.unwrap();
        mallory
            .groups
            .decrypt_group_message("channel-1", "alice", &before, None)
            .await
            .unwrap();

        // Mallory is removed; Alice rotates and sends again.
        alice.groups.rotate_sender_keys("channel-1").await.unwrap();
        let after = alice
            .groups
            .encrypt_for_group("channel-1", "without mallory")
            .await
            .unwrap();

        // The new chain id differs from the one Mallory derived her chain from.
        let (Envelope::Group(old_wire), Envelope::Group(new_wire)) =
            (Envelope::parse(&before), Envelope::parse(&after))
        else {
            panic!("expected group envelopes");
        };
        assert_ne!(old_wire.message.chain_id, new_wire.message.chain_id);

        // Bob refetches the new distribution transparently and keeps up.
        assert_eq!(
            bob.groups
                .decrypt_group_message("channel-1", "alice", &after, None)
                .await
                .unwrap(),
            "without mallory"
        );
    }

    #[tokio::test]
    async fn out_of_order_group_messages() {
        let server = TestServer::new();
        let alice = test_member(&server, "alice", 11);
        let bob = test_member(&server, "bob", 12);

        let first = alice.groups.encrypt_for_group("channel-1", "first").await.unwrap();
        let second = alice.groups.encrypt_for_group("channel-1", "second").await.unwrap();

        assert_eq!(
            bob.groups
                .decrypt_group_message("channel-1", "alice", &second, None)
                .await
                .unwrap(),
            "second"
        );
        assert_eq!(
            bob.groups
                .decrypt_group_message("channel-1", "alice", &first, None)
                .await
                .unwrap(),
            "first"
        );
    }

    #[tokio::test]
    async fn unknown_sender_has_no_key() {
        let server = TestServer::new();
        let alice = test_member(&server, "alice", 13);
        let bob = test_member(&server, "bob", 14);

        let wire = alice.groups.encrypt_for_group("channel-1", "hi").await.unwrap();

        // Bob asks for the wrong sender, whose distribution was never uploaded.
        assert!(matches!(
            bob.groups
                .decrypt_group_message("channel-1", "carol", &wire, None)
                .await,
            Err(GroupSessionError::NoSenderKey(_))
        ));
    }

    #[tokio::test]
    async fn legacy_group_content_falls_back() {
        let server = TestServer::new();
        let bob = test_member(&server, "bob", 15);

        let plaintext = bob
            .groups
            .decrypt_group_message("channel-1", "alice", b"plain announcement", None)
            .await
            .unwrap();
        assert_eq!(plaintext, "plain announcement");
    }

    #[tokio::test]
    async fn foreign_version_group_envelope_falls_back() {
        let server = TestServer::new();
        let bob = test_member(&server, "bob", 20);

        // A well-formed envelope of a version this build does not speak passes through like
        // legacy plaintext.
        let body = br#"{"v": 2, "sk": true, "payload": "from a newer client"}"#;
        let plaintext = bob
            .groups
            .decrypt_group_message("channel-1", "alice", body, None)
            .await
            .unwrap();
        assert_eq!(plaintext, String::from_utf8_lossy(body));
    }

    #[tokio::test]
    async fn group_decrypt_cache_is_idempotent() {
        let server = TestServer::new();
        let alice = test_member(&server, "alice", 16);
        let bob = test_member(&server, "bob", 17);

        let wire = alice.groups.encrypt_for_group("channel-1", "hi").await.unwrap();

        let first = bob
            .groups
            .decrypt_group_message("channel-1", "alice", &wire, Some("msg-1"))
            .await
            .unwrap();
        let chain_after_first = bob
            .store
            .receiver_chain("channel-1", "alice")
            .await
            .unwrap()
            .unwrap();

        let second = bob
            .groups
            .decrypt_group_message("channel-1", "alice", &wire, Some("msg-1"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(
            bob.store
                .receiver_chain("channel-1", "alice")
                .await
                .unwrap()
                .unwrap(),
            chain_after_first
        );
    }

    #[tokio::test]
    async fn processed_distribution_overwrites_prior_chain() {
        let server = TestServer::new();
        let alice = test_member(&server, "alice", 18);
        let bob = test_member(&server, "bob", 19);

        // Bob follows Alice's first chain.
        let first = alice.groups.encrypt_for_group("channel-1", "one").await.unwrap();
        bob.groups
            .decrypt_group_message("channel-1", "alice", &first, None)
            .await
            .unwrap();

        // Alice rotates; her new distribution arrives out-of-band.
        alice.groups.rotate_sender_keys("channel-1").await.unwrap();
        let second = alice.groups.encrypt_for_group("channel-1", "two").await.unwrap();

        let distributions = server.distributions_for("channel-1");
        let remote = distributions
            .iter()
            .find(|remote| remote.sender_id == "alice")
            .unwrap();
        bob.groups
            .process_sender_key_distribution("channel-1", "alice", &remote.distribution)
            .await
            .unwrap();

        assert_eq!(
            bob.groups
                .decrypt_group_message("channel-1", "alice", &second, None)
                .await
                .unwrap(),
            "two"
        );
    }
}
