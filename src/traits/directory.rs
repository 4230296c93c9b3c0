// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use serde::{Deserialize, Serialize};

use crate::group::SenderKeyDistribution;
use crate::key_bundle::{OneTimePrekeyPublic, PrekeyBundle, RegistrationKeys};

/// Remote directory holding the published key material of all users.
///
/// Implementations talk to the chat server. Only public halves ever cross this boundary; the
/// directory is untrusted and every bundle it serves is verified against the owner's identity
/// key before use.
pub trait KeyDirectory: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    /// Publishes a complete set of registration keys, replacing whatever the directory held for
    /// this user before.
    fn register_keys(
        &self,
        keys: &RegistrationKeys,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Fetches the pre-key bundle of a peer, with at most one one-time pre-key which the
    /// directory removes from the pool on delivery.
    fn key_bundle(
        &self,
        peer_id: &str,
    ) -> impl Future<Output = Result<Option<PrekeyBundle>, Self::Error>> + Send;

    /// Adds one-time pre-keys to the published pool.
    fn upload_onetime_prekeys(
        &self,
        prekeys: &[OneTimePrekeyPublic],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Number of unconsumed one-time pre-keys the directory still holds for this user.
    fn onetime_prekey_count(&self) -> impl Future<Output = Result<u32, Self::Error>> + Send;
}

/// Sender-key distribution fetched from the directory, annotated with its author.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteDistribution {
    pub sender_id: String,
    pub chain_id: u32,
    pub distribution: SenderKeyDistribution,
}

/// Remote directory for per-channel sender-key distributions.
pub trait SenderKeyDirectory: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    /// Publishes our current distribution for a channel, replacing any previous one under our
    /// user id.
    fn upload_distribution(
        &self,
        channel_id: &str,
        distribution: &SenderKeyDistribution,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// All current distributions for a channel, one per publishing member.
    fn distributions(
        &self,
        channel_id: &str,
    ) -> impl Future<Output = Result<Vec<RemoteDistribution>, Self::Error>> + Send;
}
