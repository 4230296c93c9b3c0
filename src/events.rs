// SPDX-License-Identifier: MIT OR Apache-2.0

//! Security events surfaced to the embedding application.

/// Observable security event, delivered through the engine's broadcast channel.
///
/// These never block or fail the operation that raised them. The protocol stores the new state
/// and continues; warning the user is the subscriber's job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecurityEvent {
    /// A peer presented an identity key different from the one pinned on first use. Either the
    /// peer reinstalled and rotated keys, or someone is in the middle.
    IdentityKeyChanged { peer_id: String },
}
