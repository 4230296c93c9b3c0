// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairwise session engine: X3DH session establishment plus Double Ratchet messaging.
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use ed25519_dalek::VerifyingKey;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::crypto::x25519::SecretKey;
use crate::crypto::{Rng, RngError};
use crate::events::SecurityEvent;
use crate::key_bundle::{KeyBundleError, SignedPrekeyId};
use crate::key_manager::{KeyManager, KeyManagerError};
use crate::lock_map::LockMap;
use crate::store::{CachedPlaintext, CryptoStore};
use crate::traits::KeyDirectory;
use crate::two_party::ratchet::{EncryptedMessage, RatchetError, RatchetState};
use crate::two_party::x3dh::{self, X3dhError};
use crate::wire::{Envelope, HandshakeHeader, WIRE_VERSION, WireMessage};

/// Encrypts and decrypts direct messages, establishing sessions on demand.
///
/// All operations for the same peer are serialized through a per-peer mutex; ratchet state is
/// read-modify-write against the store and must never be advanced concurrently.
pub struct SessionManager<S, D> {
    store: Arc<S>,
    directory: Arc<D>,
    rng: Arc<Rng>,
    key_manager: KeyManager<S, D>,
    events: broadcast::Sender<SecurityEvent>,
    peer_locks: LockMap,
    warned_peers: StdMutex<HashSet<String>>,
}

impl<S, D> SessionManager<S, D>
where
    S: CryptoStore,
    D: KeyDirectory,
{
    pub fn new(
        store: Arc<S>,
        directory: Arc<D>,
        rng: Arc<Rng>,
        key_manager: KeyManager<S, D>,
        events: broadcast::Sender<SecurityEvent>,
    ) -> Self {
        Self {
            store,
            directory,
            rng,
            key_manager,
            events,
            peer_locks: LockMap::default(),
            warned_peers: StdMutex::new(HashSet::new()),
        }
    }

    /// Encrypts a message for a peer, running X3DH first if no session exists yet.
    ///
    /// Returns the serialized wire envelope; the handshake header is included only on the
    /// session's first message.
    pub async fn encrypt_for_peer(
        &self,
        peer_id: &str,
        plaintext: &str,
    ) -> Result<Vec<u8>, SessionError<S::Error, D::Error>> {
        let _guard = self.peer_locks.lock(peer_id).await;

        let session_bytes = self
            .store
            .session(peer_id)
            .await
            .map_err(SessionError::Storage)?;

        let (mut ratchet, handshake) = match session_bytes {
            Some(bytes) => (RatchetState::from_bytes(&bytes)?, None),
            None => self.initiate_session(peer_id).await?,
        };

        let encrypted = ratchet.encrypt(&self.rng, plaintext.as_bytes())?;
        self.store
            .set_session(peer_id, ratchet.to_bytes()?)
            .await
            .map_err(SessionError::Storage)?;

        let wire = WireMessage {
            v: WIRE_VERSION,
            x3dh: handshake,
            header: encrypted.header,
            ciphertext: encrypted.ciphertext,
            nonce: encrypted.nonce,
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Decrypts a wire envelope from a peer, processing the handshake header when present.
    pub async fn decrypt_from_peer(
        &self,
        peer_id: &str,
        wire_bytes: &[u8],
    ) -> Result<String, SessionError<S::Error, D::Error>> {
        let wire: WireMessage = serde_json::from_slice(wire_bytes)?;
        if wire.v != WIRE_VERSION {
            return Err(SessionError::UnsupportedVersion(wire.v));
        }

        let _guard = self.peer_locks.lock(peer_id).await;
        self.decrypt_wire(peer_id, &wire).await
    }

    /// Two-stage decrypt used directly against raw channel content.
    ///
    /// Legacy plaintext, foreign shapes and envelopes of a version this build does not speak
    /// fall back to UTF-8 decoding; only a known envelope that fails to decrypt propagates a
    /// typed error, so real corruption is never mistaken for plaintext. Previously decrypted
    /// messages are served from the cache without touching ratchet state.
    pub async fn decrypt_or_fallback(
        &self,
        peer_id: Option<&str>,
        bytes: &[u8],
        message_id: Option<&str>,
        channel_id: Option<&str>,
    ) -> Result<String, SessionError<S::Error, D::Error>> {
        // No peer means this is not a direct-message channel.
        let Some(peer_id) = peer_id else {
            return Ok(String::from_utf8_lossy(bytes).into_owned());
        };

        if let Some(message_id) = message_id {
            let cached = self
                .store
                .cached_plaintext(message_id)
                .await
                .map_err(SessionError::Storage)?;
            if let Some(plaintext) = cached {
                return Ok(plaintext);
            }
        }

        match Envelope::parse(bytes) {
            Envelope::Pairwise(wire) => {
                let _guard = self.peer_locks.lock(peer_id).await;
                match self.decrypt_wire(peer_id, &wire).await {
                    Ok(plaintext) => {
                        if let (Some(message_id), Some(channel_id)) = (message_id, channel_id) {
                            self.store
                                .cache_plaintext(CachedPlaintext {
                                    message_id: message_id.to_owned(),
                                    channel_id: channel_id.to_owned(),
                                    content: plaintext.clone(),
                                })
                                .await
                                .map_err(SessionError::Storage)?;
                        }
                        Ok(plaintext)
                    }
                    Err(err) => {
                        self.warn_once(peer_id, &err);
                        Err(err)
                    }
                }
            }
            Envelope::Unsupported(version) => {
                // Not ours to decrypt, likely written by a newer client.
                debug!(%peer_id, version, "foreign envelope version, passing content through");
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
            Envelope::Group(_) | Envelope::Legacy => {
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }

    pub async fn has_session(&self, peer_id: &str) -> Result<bool, SessionError<S::Error, D::Error>> {
        Ok(self
            .store
            .session(peer_id)
            .await
            .map_err(SessionError::Storage)?
            .is_some())
    }

    /// Drops the session with a peer; the next message in either direction runs a fresh
    /// handshake.
    pub async fn delete_session(&self, peer_id: &str) -> Result<(), SessionError<S::Error, D::Error>> {
        let _guard = self.peer_locks.lock(peer_id).await;
        self.store
            .delete_session(peer_id)
            .await
            .map_err(SessionError::Storage)
    }

    pub(crate) async fn acquire_all_locks(&self) -> Vec<tokio::sync::OwnedMutexGuard<()>> {
        self.peer_locks.lock_all().await
    }

    /// X3DH initiation against the peer's published key bundle. Caller holds the peer lock.
    async fn initiate_session(
        &self,
        peer_id: &str,
    ) -> Result<(RatchetState, Option<HandshakeHeader>), SessionError<S::Error, D::Error>> {
        let bundle = self
            .directory
            .key_bundle(peer_id)
            .await
            .map_err(SessionError::Directory)?
            .ok_or_else(|| SessionError::MissingKeyBundle(peer_id.to_owned()))?;

        let signing_key = self.key_manager.signing_key().await?;
        let outcome = x3dh::initiate(&self.rng, &signing_key, &bundle)?;

        self.record_peer_identity(peer_id, bundle.identity_key)
            .await?;

        // The peer's signed pre-key doubles as their first ratchet key.
        let ratchet = RatchetState::init_initiator(
            &self.rng,
            outcome.shared_secret,
            bundle.signed_prekey.public_key,
        )?;

        let handshake = HandshakeHeader {
            identity_key: signing_key.verifying_key().to_bytes(),
            ephemeral_key: outcome.ephemeral_key,
            signed_prekey_id: bundle.signed_prekey.key_id,
            one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|prekey| prekey.key_id),
        };

        Ok((ratchet, Some(handshake)))
    }

    /// Decrypts a parsed envelope. Caller holds the peer lock.
    async fn decrypt_wire(
        &self,
        peer_id: &str,
        wire: &WireMessage,
    ) -> Result<String, SessionError<S::Error, D::Error>> {
        let mut session = self
            .store
            .session(peer_id)
            .await
            .map_err(SessionError::Storage)?
            .map(|bytes| RatchetState::from_bytes(&bytes))
            .transpose()?;

        if let Some(handshake) = &wire.x3dh {
            session = Some(self.respond_to_handshake(peer_id, handshake).await?);
        }

        let mut ratchet = session.ok_or_else(|| SessionError::NoSession(peer_id.to_owned()))?;

        let message = EncryptedMessage {
            header: wire.header.clone(),
            ciphertext: wire.ciphertext.clone(),
            nonce: wire.nonce,
        };
        let plaintext = ratchet.decrypt(&self.rng, &message)?;

        self.store
            .set_session(peer_id, ratchet.to_bytes()?)
            .await
            .map_err(SessionError::Storage)?;

        Ok(String::from_utf8_lossy(&plaintext).into_owned())
    }

    /// X3DH response to a first message from a peer, replacing any existing session.
    async fn respond_to_handshake(
        &self,
        peer_id: &str,
        handshake: &HandshakeHeader,
    ) -> Result<RatchetState, SessionError<S::Error, D::Error>> {
        let signing_key = self.key_manager.signing_key().await?;

        let signed_prekey = self
            .store
            .signed_prekey(handshake.signed_prekey_id)
            .await
            .map_err(SessionError::Storage)?
            .ok_or(SessionError::PrekeyNotFound(handshake.signed_prekey_id))?;
        let signed_prekey_secret = SecretKey::from_bytes(*signed_prekey.secret_key.as_bytes());

        // Consume the referenced one-time pre-key transactionally. Absence is tolerated, the
        // initiator may have been handed a pre-key this device already burned in a race; the
        // agreement then simply fails to authenticate further down.
        let onetime_secret = match handshake.one_time_prekey_id {
            Some(key_id) => self
                .store
                .take_onetime_prekey(key_id)
                .await
                .map_err(SessionError::Storage)?
                .map(|record| SecretKey::from_bytes(*record.secret_key.as_bytes())),
            None => None,
        };

        let their_identity = VerifyingKey::from_bytes(&handshake.identity_key)
            .map_err(|_| SessionError::KeyBundle(KeyBundleError::InvalidIdentityKey))?;

        let outcome = x3dh::respond(
            &signing_key,
            &signed_prekey_secret,
            onetime_secret.as_ref(),
            &their_identity,
            &handshake.ephemeral_key,
        )?;

        self.record_peer_identity(peer_id, handshake.identity_key)
            .await?;

        Ok(RatchetState::init_responder(
            outcome.shared_secret,
            signed_prekey_secret,
        ))
    }

    /// Trust-on-first-use pinning with change detection.
    ///
    /// A changed key raises [`SecurityEvent::IdentityKeyChanged`] before the stored key is
    /// overwritten, then proceeds; blocking here would let an attacker deny service with a
    /// spoofed key.
    async fn record_peer_identity(
        &self,
        peer_id: &str,
        identity_key: [u8; 32],
    ) -> Result<(), SessionError<S::Error, D::Error>> {
        let previous = self
            .store
            .peer_identity(peer_id)
            .await
            .map_err(SessionError::Storage)?;

        match previous {
            Some(pinned) if pinned == identity_key => return Ok(()),
            Some(_) => {
                warn!(%peer_id, "peer identity key changed since first contact");
                let _ = self.events.send(SecurityEvent::IdentityKeyChanged {
                    peer_id: peer_id.to_owned(),
                });
            }
            None => (),
        }

        self.store
            .set_peer_identity(peer_id, identity_key)
            .await
            .map_err(SessionError::Storage)
    }

    /// Logs a decrypt failure at most once per peer so a corrupted history cannot flood the
    /// logs, one line per message.
    fn warn_once(&self, peer_id: &str, err: &SessionError<S::Error, D::Error>) {
        let mut warned = self.warned_peers.lock().expect("acquire warned peers set");
        if warned.insert(peer_id.to_owned()) {
            warn!(%peer_id, error = %err, "failed to decrypt pairwise message");
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError<SE, DE> {
    #[error("crypto store failed: {0}")]
    Storage(SE),

    #[error("key directory request failed: {0}")]
    Directory(DE),

    #[error("peer {0} has not published a key bundle")]
    MissingKeyBundle(String),

    #[error("signed pre-key {0} not found locally, it may have been rotated away")]
    PrekeyNotFound(SignedPrekeyId),

    #[error("no session with peer {0} and message carries no handshake header")]
    NoSession(String),

    #[error("unsupported wire message version {0}")]
    UnsupportedVersion(u64),

    #[error(transparent)]
    KeyBundle(#[from] KeyBundleError),

    #[error(transparent)]
    X3dh(#[from] X3dhError),

    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    #[error(transparent)]
    KeyManager(#[from] KeyManagerError<SE, DE>),

    #[error("wire message encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Rng(#[from] RngError),
}
