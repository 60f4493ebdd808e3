//! Durable backend trait for the local store.

use shelfsync_common::Result;

use crate::snapshot::{Snapshot, WriteBatch};

/// Durable storage underneath a [`LocalStore`](crate::LocalStore).
///
/// The store keeps its working state in memory and hands every transaction to
/// the backend as one commit. Implementations must make each commit atomic:
/// after a crash the durable state reflects either all of a batch or none of it.
pub trait StoreBackend: Send + Sync {
    /// Backend name (e.g., "memory", "json", "sqlite").
    fn name(&self) -> &str;

    /// Load the last committed state.
    ///
    /// # Errors
    /// - Storage unreadable or corrupt
    fn load(&self) -> Result<Snapshot>;

    /// Durably apply one transaction.
    ///
    /// `batch` holds exactly the writes of the transaction; `state` is the
    /// complete state after applying them, for backends that persist whole
    /// snapshots.
    ///
    /// # Postconditions
    /// - On `Ok`, the batch is durable
    /// - On `Err`, the durable state is unchanged
    fn commit(&self, batch: &WriteBatch, state: &Snapshot) -> Result<()>;
}
