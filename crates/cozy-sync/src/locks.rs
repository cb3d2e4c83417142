// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-document execution locks.
//!
//! The Sync Executor guarantees at-most-one in-flight operation per
//! document id: a second arrival for the same id waits for the first to
//! finish rather than racing it.

use cozy_merge::LockCheck;
use cozy_path::DocId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of per-id mutexes, with a cheap `is_locked` check the Merger
/// consults before rewriting a folder's descendants in bulk.
#[derive(Default)]
pub struct PathLocks {
    mutexes: Mutex<HashMap<DocId, Arc<AsyncMutex<()>>>>,
    held: Mutex<HashSet<DocId>>,
}

/// Held while a document's operation runs; releases the lock on drop.
pub struct LockGuard<'a> {
    locks: &'a PathLocks,
    id: DocId,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().unwrap().remove(&self.id);
    }
}

impl PathLocks {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, id: &DocId) -> Arc<AsyncMutex<()>> {
        let mut mutexes = self.mutexes.lock().unwrap();
        mutexes
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for, then hold, the lock for `id`. A concurrent caller for a
    /// different id proceeds immediately.
    pub async fn acquire(&self, id: DocId) -> LockGuard<'_> {
        let mutex = self.mutex_for(&id);
        let guard = mutex.lock_owned().await;
        self.held.lock().unwrap().insert(id.clone());
        LockGuard {
            locks: self,
            id,
            _guard: guard,
        }
    }
}

impl LockCheck for PathLocks {
    fn is_locked(&self, id: &DocId) -> bool {
        self.held.lock().unwrap().contains(id)
    }
}
