//! In-memory store backend for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use shelfsync_common::{Error, Result};

use crate::backend::StoreBackend;
use crate::snapshot::{Snapshot, WriteBatch};

/// In-memory store backend.
///
/// Useful for testing and development. All data is stored in memory and lost
/// on drop. Cloned handles share the same committed state, which lets a test
/// "reopen" a store and observe exactly what was committed.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    committed: Arc<RwLock<Snapshot>>,
    commits: Arc<AtomicUsize>,
    failures_pending: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            committed: Arc::new(RwLock::new(snapshot)),
            ..Self::default()
        }
    }

    /// Make the next `count` commits fail with a storage error.
    pub fn fail_next_commits(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Copy of the committed state.
    pub fn committed(&self) -> Result<Snapshot> {
        self.load()
    }
}

impl StoreBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn load(&self) -> Result<Snapshot> {
        self.committed
            .read()
            .map(|snapshot| snapshot.clone())
            .map_err(|_| Error::Storage("Memory backend lock poisoned".to_string()))
    }

    fn commit(&self, _batch: &WriteBatch, state: &Snapshot) -> Result<()> {
        let should_fail = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::Storage("Injected commit failure".to_string()));
        }

        let mut committed = self
            .committed
            .write()
            .map_err(|_| Error::Storage("Memory backend lock poisoned".to_string()))?;
        *committed = state.clone();
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
