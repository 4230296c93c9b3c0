// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairwise encryption: X3DH key agreement and Double Ratchet sessions.
pub mod ratchet;
mod session;
pub mod x3dh;

pub use ratchet::{EncryptedMessage, MessageHeader, RatchetError, RatchetState};
pub use session::{SessionError, SessionManager};
