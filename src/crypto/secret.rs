// SPDX-License-Identifier: MIT OR Apache-2.0

//! Container type for secret key material.
use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

/// Fixed-size secret bytes: root keys, chain keys, message keys, DH outputs and the private
/// halves of stored key pairs.
///
/// The wrapper guards against accidental misuse rather than providing hard guarantees. Bytes
/// are zeroised on drop, reachable only through crate-private accessors, compared in constant
/// time, and redacted from `Debug` output. Side channels below that (caches, swapped pages,
/// hardware) are out of scope for a software wrapper.
///
/// Ratchet and chain state embeds secrets directly, so the type serializes transparently as its
/// raw bytes.
#[derive(Clone, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct Secret<const N: usize>(#[serde(with = "serde_bytes")] [u8; N]);

impl<const N: usize> Secret<N> {
    pub(crate) fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        // Constant time, the comparison must not leak how many leading bytes matched.
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret<{N}>(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::Secret;

    #[test]
    fn compares_by_value() {
        assert_eq!(Secret::from_bytes([1u8; 32]), Secret::from_bytes([1u8; 32]));
        assert_ne!(Secret::from_bytes([1u8; 32]), Secret::from_bytes([2u8; 32]));
    }

    #[test]
    fn debug_output_is_redacted() {
        let secret = Secret::from_bytes([0xAB; 32]);
        assert_eq!(format!("{secret:?}"), "Secret<32>(..)");
    }

    #[test]
    fn serialization_roundtrip() {
        let secret = Secret::from_bytes([9u8; 32]);
        let bytes = serde_json::to_vec(&secret).unwrap();
        let decoded: Secret<32> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(secret, decoded);
    }
}
