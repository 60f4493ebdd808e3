//! Durable local state for ShelfSync.
//!
//! This crate holds the two pieces of state that must survive a crash together:
//! - the record cache, with a per-record synchronization state
//! - the pending operation queue, coalescing repeated intents per record
//!
//! Both are mutated only through [`LocalStore::transaction`], which commits the
//! combined write set to a [`StoreBackend`] as one atomic unit.
//!
//! # Backends
//! - [`MemoryBackend`]: volatile, for tests
//! - [`JsonFileBackend`]: whole-snapshot document with atomic replace
//! - [`SqliteBackend`]: relational tables, one SQLite transaction per commit

pub mod backend;
pub mod json;
pub mod memory;
pub mod queue;
pub mod record;
pub mod snapshot;
pub mod sqlite;
pub mod store;

pub use backend::StoreBackend;
pub use json::JsonFileBackend;
pub use memory::MemoryBackend;
pub use queue::{coalesce, AckOutcome, CoalesceStep, OperationKind, PendingOperation};
pub use record::{Record, SyncState};
pub use snapshot::{Snapshot, WriteBatch};
pub use sqlite::SqliteBackend;
pub use store::{LocalStore, Transaction};
