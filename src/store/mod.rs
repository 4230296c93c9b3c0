// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces and implementations to persist cryptographic state.
mod memory;
mod traits;

pub use memory::MemoryStore;
pub use traits::{
    CachedPlaintext, CryptoStore, IdentityRecord, OneTimePrekeyRecord, SignedPrekeyRecord,
};
