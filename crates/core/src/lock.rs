//! Per-location coordination between readers and removal

use crate::error::{ContentError, Result};
use crate::hash::ContentHash;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Registry of per-hash locks
///
/// Entries are created on first use and dropped again once no caller holds
/// them, so the map only ever contains locations that are currently in use.
/// Readers share a location; removal takes it exclusively. The lock is
/// task-fair, so a reader arriving while a removal waits or runs queues
/// behind it and gives up after the configured timeout.
pub struct ContentLocks {
    locks: DashMap<ContentHash, Arc<RwLock<()>>>,
    timeout: Duration,
}

impl ContentLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `f` while sharing the location with other readers.
    ///
    /// Fails with `ContentLockTimeout` if the location stays exclusively held
    /// for longer than the timeout.
    pub fn with_shared<T>(&self, hash: ContentHash, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.checkout(hash);
        let result = match lock.try_read_for(self.timeout) {
            Some(_guard) => f(),
            None => Err(ContentError::ContentLockTimeout {
                hash,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };
        self.checkin(hash, lock);
        result
    }

    /// Run `f` while holding the location exclusively
    pub fn with_exclusive<T>(&self, hash: ContentHash, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.checkout(hash);
        let result = {
            let _guard = lock.write();
            f()
        };
        self.checkin(hash, lock);
        result
    }

    /// Number of locations currently tracked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn checkout(&self, hash: ContentHash) -> Arc<RwLock<()>> {
        self.locks
            .entry(hash)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn checkin(&self, hash: ContentHash, lock: Arc<RwLock<()>>) {
        drop(lock);
        // Clones are only handed out under the shard lock, so a count of one
        // means nobody else can be waiting on this entry.
        self.locks.remove_if(&hash, |_, lock| Arc::strong_count(lock) == 1);
    }
}
