//! Application-facing facade: optimistic mutations plus reconciliation.

use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use shelfsync_common::{Error, FieldMap, RecordId, Result};
use shelfsync_remote::RemoteClient;
use shelfsync_store::{LocalStore, OperationKind, PendingOperation, Record, SyncState};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::coordinator::SyncCoordinator;
use crate::report::SyncReport;
use crate::scheduler::{SyncScheduler, SyncTrigger};

/// What deleting a record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The record never reached the remote store and is gone.
    Discarded,
    /// The record is marked `PendingDelete` until the remote confirms.
    Queued,
}

/// Local-first record service.
///
/// Every mutation updates the local store and its pending operation in one
/// transaction and returns at once; nothing here waits on the network except
/// [`SyncService::reconcile`].
pub struct SyncService {
    store: Arc<LocalStore>,
    coordinator: Arc<SyncCoordinator>,
}

impl SyncService {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteClient>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        let coordinator = SyncCoordinator::new(store.clone(), remote, connectivity, config);
        Self {
            store,
            coordinator: Arc::new(coordinator),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn list_records(&self) -> Result<Vec<Record>> {
        self.store.list()
    }

    pub fn get_record(&self, id: &RecordId) -> Result<Record> {
        self.store.get(id)
    }

    /// Create a record under a fresh temporary id.
    pub fn create_record(&self, fields: FieldMap) -> Result<Record> {
        let record = Record::new_local(fields);
        self.store.transaction(|tx| {
            tx.enqueue(
                record.id.clone(),
                OperationKind::Create {
                    fields: record.fields.clone(),
                },
            )?;
            tx.upsert(record.clone());
            Ok(())
        })?;

        debug!("Created {}", record.id);
        Ok(record)
    }

    /// Set the given fields on a record.
    ///
    /// # Errors
    /// - `InvalidInput` if `edits` is empty
    /// - `NotFound` if the record does not exist
    /// - `RecordAlreadyDeleting` if a delete is pending
    pub fn update_record(&self, id: &RecordId, edits: FieldMap) -> Result<Record> {
        if edits.is_empty() {
            return Err(Error::InvalidInput("No fields to update".to_string()));
        }

        self.store.transaction(|tx| {
            let id = tx.resolve(id);
            let mut record = tx.require(&id)?;
            if record.sync_state == SyncState::PendingDelete {
                return Err(Error::RecordAlreadyDeleting(id));
            }

            record.apply_edits(&edits);
            let kind = match &record.sync_state {
                SyncState::PendingCreate if tx.operation_for(&id).is_some() => {
                    OperationKind::update(edits)
                }
                // A rejected create is resubmitted whole.
                SyncState::PendingCreate => OperationKind::Create {
                    fields: record.fields.clone(),
                },
                // Fields of an earlier rejected update are sent again too.
                SyncState::PendingUpdate(changed) => OperationKind::update(
                    changed
                        .iter()
                        .filter_map(|name| {
                            record.fields.get(name).map(|v| (name.clone(), v.clone()))
                        })
                        .collect(),
                ),
                SyncState::Synced | SyncState::PendingDelete => {
                    return Err(Error::Storage(format!(
                        "Unexpected state {} after edit",
                        record.sync_state.label()
                    )))
                }
            };

            tx.enqueue(id, kind)?;
            tx.upsert(record.clone());
            Ok(record)
        })
    }

    /// Set one field on a record.
    pub fn update_field(&self, id: &RecordId, field: &str, value: Value) -> Result<Record> {
        let mut edits = FieldMap::new();
        edits.insert(field.to_string(), value);
        self.update_record(id, edits)
    }

    /// Delete a record.
    ///
    /// A record the remote store has never seen is removed at once and its
    /// pending create cancelled. Otherwise the record stays visible as
    /// `PendingDelete` until the delete is confirmed.
    pub fn delete_record(&self, id: &RecordId) -> Result<DeleteOutcome> {
        self.store.transaction(|tx| {
            let id = tx.resolve(id);
            let mut record = tx.require(&id)?;
            if record.sync_state == SyncState::PendingDelete {
                return Err(Error::RecordAlreadyDeleting(id));
            }

            tx.enqueue(id.clone(), OperationKind::Delete)?;
            if id.is_temporary() {
                tx.remove(&id);
                Ok(DeleteOutcome::Discarded)
            } else {
                record.sync_state = SyncState::PendingDelete;
                tx.upsert(record);
                Ok(DeleteOutcome::Queued)
            }
        })
    }

    /// Run one reconciliation now.
    pub async fn reconcile(&self) -> Result<SyncReport> {
        self.coordinator.reconcile().await
    }

    /// Pending operations, oldest first.
    pub fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.store.list_pending()
    }

    /// Re-queue the intent implied by a record's pending state.
    ///
    /// Used after a permanent rejection dropped the record's operation. Returns
    /// the operation now queued, or `None` for a synced record.
    pub fn retry_record(&self, id: &RecordId) -> Result<Option<PendingOperation>> {
        self.store.transaction(|tx| {
            let id = tx.resolve(id);
            let record = tx.require(&id)?;
            if let Some(op) = tx.operation_for(&id) {
                return Ok(Some(op.clone()));
            }

            let kind = match &record.sync_state {
                SyncState::Synced => return Ok(None),
                SyncState::PendingCreate => OperationKind::Create {
                    fields: record.fields.clone(),
                },
                SyncState::PendingUpdate(changed) => OperationKind::update(
                    changed
                        .iter()
                        .filter_map(|name| {
                            record.fields.get(name).map(|v| (name.clone(), v.clone()))
                        })
                        .collect(),
                ),
                SyncState::PendingDelete => OperationKind::Delete,
            };

            info!("Retrying {} for {}", kind.label(), id);
            tx.enqueue(id, kind)
        })
    }

    /// Abandon a record's unconfirmed local changes.
    ///
    /// A record the remote store has never seen is removed; any other record
    /// is marked `Synced` so the next merge restores the remote version.
    /// Returns the record if it still exists.
    pub fn discard_local_changes(&self, id: &RecordId) -> Result<Option<Record>> {
        self.store.transaction(|tx| {
            let id = tx.resolve(id);
            let mut record = tx.require(&id)?;
            if let Some(op_id) = tx.operation_for(&id).map(|op| op.id) {
                tx.cancel(&op_id);
            }

            info!("Discarding local changes to {}", id);
            if id.is_temporary() {
                tx.remove(&id);
                Ok(None)
            } else {
                record.mark_synced();
                tx.upsert(record.clone());
                Ok(Some(record))
            }
        })
    }

    /// Spawn the background scheduler for the configured sync mode.
    ///
    /// The returned [`SyncScheduler`] requests syncs and shuts the loop down.
    pub fn start_scheduler(&self) -> (SyncScheduler, JoinHandle<()>) {
        let (scheduler, handle) = SyncScheduler::new(self.coordinator.config().sync_mode.clone());
        let transitions = self.coordinator.transitions();
        let coordinator = self.coordinator.clone();

        let task = tokio::spawn(handle.run(transitions, move |trigger: SyncTrigger| {
            let coordinator = coordinator.clone();
            async move {
                debug!("Sync triggered: {:?}", trigger);
                coordinator.reconcile().await
            }
        }));

        (scheduler, task)
    }
}
