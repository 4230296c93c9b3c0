// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON wire envelopes carried inside the transport's opaque ciphertext field.
//!
//! A single `v` discriminator separates pairwise envelopes (`v: 1`, no `sk`) from group
//! envelopes (`v: 1, sk: true`). Anything that does not parse as either is legacy plaintext
//! from before encryption was rolled out and is decoded as raw UTF-8 by the engines.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::aead::NONCE_SIZE;
use crate::crypto::x25519::PublicKey;
use crate::group::SenderKeyMessage;
use crate::key_bundle::{OneTimePrekeyId, SignedPrekeyId};
use crate::two_party::MessageHeader;

pub const WIRE_VERSION: u64 = 1;

/// Handshake material carried on the first message of a new pairwise session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeHeader {
    /// Initiator's Ed25519 identity public key.
    pub identity_key: [u8; 32],

    /// Initiator's ephemeral X25519 public key from the key agreement.
    pub ephemeral_key: PublicKey,

    /// Id of the responder's signed pre-key the initiator used.
    pub signed_prekey_id: SignedPrekeyId,

    /// Id of the responder's one-time pre-key, when the bundle contained one.
    #[serde(default)]
    pub one_time_prekey_id: Option<OneTimePrekeyId>,
}

/// Envelope of a pairwise message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub v: u64,

    /// Present only on the first message of a new session. Absence means "continue the
    /// existing ratchet session".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x3dh: Option<HandshakeHeader>,

    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

/// Envelope of a group message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupWireMessage {
    pub v: u64,
    pub sk: bool,
    pub message: SenderKeyMessage,
}

impl GroupWireMessage {
    pub fn new(message: SenderKeyMessage) -> Self {
        Self {
            v: WIRE_VERSION,
            sk: true,
            message,
        }
    }
}

/// Classified envelope of an incoming message body.
#[derive(Clone, Debug)]
pub enum Envelope {
    Pairwise(Box<WireMessage>),
    Group(GroupWireMessage),

    /// Not an envelope of ours. Legacy plaintext shares the channel with encrypted content, so
    /// this is an expected shape, not an error.
    Legacy,

    /// Well-formed envelope of a version this build does not speak.
    Unsupported(u64),
}

impl Envelope {
    /// Classifies raw message bytes.
    ///
    /// Structural mismatches map to [`Envelope::Legacy`], recognizable envelopes of a foreign
    /// version to [`Envelope::Unsupported`]; both count as "not ours" to the engines. Real
    /// corruption inside a known envelope still surfaces as a typed error further down instead
    /// of being mistaken for plaintext.
    pub fn parse(bytes: &[u8]) -> Self {
        let Ok(value) = serde_json::from_slice::<Value>(bytes) else {
            return Envelope::Legacy;
        };
        let Some(version) = value.get("v").and_then(Value::as_u64) else {
            return Envelope::Legacy;
        };
        if version != WIRE_VERSION {
            return Envelope::Unsupported(version);
        }

        if value.get("sk").and_then(Value::as_bool) == Some(true) {
            match serde_json::from_value(value) {
                Ok(message) => Envelope::Group(message),
                Err(_) => Envelope::Legacy,
            }
        } else {
            match serde_json::from_value(value) {
                Ok(message) => Envelope::Pairwise(Box::new(message)),
                Err(_) => Envelope::Legacy,
            }
        }
    }
}
