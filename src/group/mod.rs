// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sender-Key group encryption for multi-member channels.
mod sender_keys;
mod session;

pub use sender_keys::{
    MAX_SKIP, ReceiverChain, SenderChain, SenderKeyDistribution, SenderKeyError, SenderKeyMessage,
};
pub use session::{GroupSessionError, GroupSessionManager};
