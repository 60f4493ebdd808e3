//! Pending operations and the coalescing rules applied on enqueue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use shelfsync_common::{Error, FieldMap, OperationId, RecordId, Result};

/// The mutation a pending operation will apply remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    /// Create the record with these fields.
    Create { fields: FieldMap },
    /// Set the changed fields to the given values.
    Update {
        changed: BTreeSet<String>,
        values: FieldMap,
    },
    /// Delete the record.
    Delete,
}

impl OperationKind {
    /// Build an update touching exactly the fields in `values`.
    pub fn update(values: FieldMap) -> Self {
        OperationKind::Update {
            changed: values.keys().cloned().collect(),
            values,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Create { .. } => "create",
            OperationKind::Update { .. } => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// A local mutation not yet confirmed by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique ID for this operation.
    pub id: OperationId,
    /// Record the operation targets.
    pub record_id: RecordId,
    /// What to apply remotely.
    pub kind: OperationKind,
    /// When the first intent was recorded.
    pub created_at: DateTime<Utc>,
    /// Queue position; FIFO order is ascending sequence.
    pub sequence: u64,
    /// Bumped whenever a newer intent is coalesced in.
    pub revision: u32,
    /// Number of failed remote attempts.
    pub attempts: u32,
    /// Last error message if an attempt failed.
    pub last_error: Option<String>,
}

impl PendingOperation {
    pub fn new(record_id: RecordId, kind: OperationKind, sequence: u64) -> Self {
        Self {
            id: OperationId::new(),
            record_id,
            kind,
            created_at: Utc::now(),
            sequence,
            revision: 0,
            attempts: 0,
            last_error: None,
        }
    }

    /// Record a failed attempt; the operation stays queued.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
    }

    /// Replace the payload with a coalesced intent.
    pub fn supersede(&mut self, kind: OperationKind) {
        self.kind = kind;
        self.revision += 1;
    }
}

/// What enqueuing an intent does to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum CoalesceStep {
    /// No operation exists for the record; append one.
    Append(OperationKind),
    /// Fold into the existing operation, replacing its payload.
    Merge(OperationKind),
    /// Drop the existing operation; nothing will be sent.
    Cancel,
    /// Nothing to send at all.
    Skip,
}

/// Result of acknowledging an operation at a known revision.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The operation was removed from the queue.
    Acknowledged,
    /// A newer intent was coalesced since dispatch; the operation stays.
    Superseded(PendingOperation),
    /// The operation no longer exists.
    Missing,
}

/// Decide how `incoming` combines with the record's existing pending operation.
///
/// # Errors
/// - `RecordAlreadyDeleting` if a delete is already pending
/// - `InvalidInput` for intents that cannot follow the existing one
pub fn coalesce(
    record_id: &RecordId,
    existing: Option<&OperationKind>,
    incoming: OperationKind,
) -> Result<CoalesceStep> {
    use OperationKind::*;

    let Some(existing) = existing else {
        return match incoming {
            // The remote never saw this record, so there is nothing to delete.
            Delete if record_id.is_temporary() => Ok(CoalesceStep::Skip),
            Update { .. } if record_id.is_temporary() => Err(Error::InvalidInput(format!(
                "Record {} has no server id and no pending create",
                record_id
            ))),
            Create { .. } if !record_id.is_temporary() => Err(Error::InvalidInput(format!(
                "Record {} already exists remotely",
                record_id
            ))),
            kind => Ok(CoalesceStep::Append(kind)),
        };
    };

    match (existing, incoming) {
        (Delete, _) => Err(Error::RecordAlreadyDeleting(record_id.clone())),

        (Create { fields }, Update { values, .. }) => {
            let mut merged = fields.clone();
            merged.extend(values);
            Ok(CoalesceStep::Merge(Create { fields: merged }))
        }
        (Create { .. }, Delete) => Ok(CoalesceStep::Cancel),

        (
            Update {
                changed: old_changed,
                values: old_values,
            },
            Update { changed, values },
        ) => {
            let mut all_changed = old_changed.clone();
            all_changed.extend(changed);
            let mut all_values = old_values.clone();
            all_values.extend(values);
            Ok(CoalesceStep::Merge(Update {
                changed: all_changed,
                values: all_values,
            }))
        }
        (Update { .. }, Delete) => Ok(CoalesceStep::Merge(Delete)),

        (_, Create { .. }) => Err(Error::InvalidInput(format!(
            "Record {} already has a pending operation",
            record_id
        ))),
    }
}
