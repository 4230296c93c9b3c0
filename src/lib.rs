// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end encryption engine for a chat system.
//!
//! Message content is unreadable to the server and any third party while staying recoverable
//! for the intended recipients under message loss and out-of-order delivery. Three cooperating
//! subsystems provide this:
//!
//! 1. **Key management**: a long-lived Ed25519 identity key, a signed pre-key and a replenished
//!    pool of one-time pre-keys, published through a server-side key directory.
//! 2. **Pairwise sessions**: X3DH key agreement against a peer's published pre-key bundle,
//!    followed by Double Ratchet encryption with forward secrecy, break-in recovery and
//!    out-of-order decryption.
//! 3. **Group sessions**: Sender-Key encryption for multi-member channels, one forward-secure
//!    chain per (channel, sender), rotated whenever membership shrinks.
//!
//! An [`Engine`] owns one user's instances of all three over a shared [`store::CryptoStore`]
//! and directory implementation. Peer identity keys are pinned on first use; a later change
//! raises a [`SecurityEvent::IdentityKeyChanged`] for the application to surface, without
//! blocking the conversation.
//!
//! Everything here is transport-agnostic: envelopes are opaque bytes to the caller, and the
//! remote directory is reached through the [`traits::KeyDirectory`] and
//! [`traits::SenderKeyDirectory`] seams.
pub mod crypto;
mod engine;
mod events;
pub mod group;
pub mod key_bundle;
pub mod key_manager;
mod lock_map;
pub mod store;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;
pub mod two_party;
pub mod wire;

pub use engine::Engine;
pub use events::SecurityEvent;
pub use group::{GroupSessionError, GroupSessionManager};
pub use key_manager::{KeyManager, KeyManagerError};
pub use store::{CryptoStore, MemoryStore};
pub use two_party::{SessionError, SessionManager};
