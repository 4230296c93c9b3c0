// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key serialization of async operations.
///
/// Pairwise ratchet and group chain state live behind read-modify-write cycles on the store;
/// two concurrent operations for the same peer or channel would lose updates or derive the same
/// message key twice. Each key gets its own async mutex, operations on different keys stay
/// fully parallel.
#[derive(Debug, Default)]
pub(crate) struct LockMap {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockMap {
    /// Acquires the lock for the given key, creating it on first use.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("acquire lock map");
            locks.entry(key.to_owned()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Acquires every lock in the map, draining all in-flight operations.
    ///
    /// Used by wipe to guarantee no encrypt or decrypt call observes a half-cleared store.
    pub async fn lock_all(&self) -> Vec<OwnedMutexGuard<()>> {
        let locks: Vec<_> = {
            let locks = self.locks.lock().expect("acquire lock map");
            locks.values().cloned().collect()
        };

        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::LockMap;

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(LockMap::default());

        let guard = locks.lock("panda").await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks.lock("panda").await;
            })
        };

        // The contender cannot finish while the guard is held.
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let locks = LockMap::default();

        let _guard = locks.lock("panda").await;
        // Does not deadlock.
        let _other = locks.lock("icebear").await;
    }
}
