// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives shared by the key manager and both session engines.
pub mod aead;
pub mod hkdf;
pub mod identity;
mod rng;
mod secret;
pub mod x25519;

pub use rng::{Rng, RngError};
pub use secret::Secret;
