//! ShelfSync sync engine
//!
//! This crate reconciles the local store with the authoritative remote store:
//! - Single-flight reconciliation: drain the pending queue, then merge the
//!   remote snapshot into records without unresolved local changes
//! - Per-operation failure isolation with transient/permanent classification
//! - Connectivity monitoring and reconnect/periodic triggers
//! - The application-facing [`SyncService`]

pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod merge;
pub mod report;
pub mod scheduler;
pub mod service;

// Re-export main types
pub use config::{SyncConfig, SyncMode};
pub use connectivity::{ConnectivityMonitor, ConnectivityTransition, ManualConnectivity};
pub use coordinator::{SyncCoordinator, SyncPhase};
pub use merge::merge_snapshot;
pub use report::{FailureClass, MergeStats, OperationFailure, SyncReport, SyncStatus};
pub use scheduler::{SyncScheduler, SyncSchedulerHandle, SyncTrigger};
pub use service::{DeleteOutcome, SyncService};
