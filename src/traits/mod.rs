// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the remote key directory.
mod directory;

pub use directory::{KeyDirectory, RemoteDistribution, SenderKeyDirectory};
