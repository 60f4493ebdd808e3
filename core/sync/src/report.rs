//! Outcome of a reconciliation run.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use shelfsync_common::{Error, OperationId, RecordId, RemoteError, Result};

/// Terminal status of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// The drain pass finished (possibly with failures).
    Completed,
    /// No connectivity, either from the start or lost mid-drain.
    Offline,
    /// Another reconciliation was in progress; nothing was done.
    AlreadyRunning,
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Kept in the queue for the next reconciliation.
    Transient,
    /// Dropped from the queue; the record keeps its pending state.
    Permanent,
}

/// A remote failure surfaced to the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationFailure {
    /// `None` for the snapshot fetch.
    pub operation_id: Option<OperationId>,
    pub record_id: Option<RecordId>,
    pub class: FailureClass,
    pub message: String,
}

impl OperationFailure {
    pub fn new(
        operation_id: Option<OperationId>,
        record_id: Option<RecordId>,
        error: &RemoteError,
    ) -> Self {
        Self {
            operation_id,
            record_id,
            class: if error.is_transient() {
                FailureClass::Transient
            } else {
                FailureClass::Permanent
            },
            message: error.message().to_string(),
        }
    }
}

/// What merging the authoritative snapshot changed locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Synced records whose fields changed remotely.
    pub refreshed: usize,
    /// Remote records new to the local cache.
    pub inserted: usize,
    /// Synced records no longer present remotely.
    pub removed: usize,
    /// Records left alone because of unresolved local changes.
    pub kept_pending: usize,
}

/// Report returned by every reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    /// Operations dispatched to the remote.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<OperationFailure>,
    /// `None` when no snapshot was merged.
    pub merge: Option<MergeStats>,
    pub duration: Duration,
}

impl SyncReport {
    pub fn new(status: SyncStatus) -> Self {
        Self {
            status,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            errors: Vec::new(),
            merge: None,
            duration: Duration::ZERO,
        }
    }

    pub fn offline() -> Self {
        Self::new(SyncStatus::Offline)
    }

    pub fn already_running() -> Self {
        Self::new(SyncStatus::AlreadyRunning)
    }

    /// Completed with no failure of any kind.
    pub fn is_clean(&self) -> bool {
        self.status == SyncStatus::Completed && self.errors.is_empty()
    }

    pub fn permanent_failures(&self) -> impl Iterator<Item = &OperationFailure> {
        self.errors
            .iter()
            .filter(|f| f.class == FailureClass::Permanent)
    }

    /// Fail with `NetworkUnavailable` if the run was offline before it
    /// dispatched anything. A run cut short mid-drain keeps its report.
    pub fn require_online(self) -> Result<Self> {
        if self.status == SyncStatus::Offline && self.attempted == 0 {
            Err(Error::NetworkUnavailable)
        } else {
            Ok(self)
        }
    }
}
