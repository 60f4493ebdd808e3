//! The local store: record cache and pending operation queue under one
//! transaction.

use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use shelfsync_common::{Error, OperationId, RecordId, Result};

use crate::backend::StoreBackend;
use crate::queue::{coalesce, AckOutcome, CoalesceStep, OperationKind, PendingOperation};
use crate::record::Record;
use crate::snapshot::{Snapshot, WriteBatch};

/// Record cache plus pending operation queue.
///
/// All reads are served from memory. Writes go through [`LocalStore::transaction`]:
/// the closure works on a private copy of the state, the resulting write set is
/// committed to the backend, and only a successful commit publishes the new
/// state. A failed commit therefore leaves memory and disk exactly as they were.
///
/// The internal lock is held only for the duration of a transaction, which never
/// performs network I/O.
pub struct LocalStore {
    backend: Box<dyn StoreBackend>,
    state: Mutex<Snapshot>,
}

impl LocalStore {
    /// Open a store, loading the last committed state from `backend`.
    pub fn open(backend: impl StoreBackend + 'static) -> Result<Self> {
        let state = backend.load()?;
        debug!(
            "Opened {} store: {} records, {} pending operations",
            backend.name(),
            state.record_count(),
            state.operation_count()
        );
        Ok(Self {
            backend: Box::new(backend),
            state: Mutex::new(state),
        })
    }

    /// Name of the durable backend.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Snapshot>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage("Store lock poisoned".to_string()))
    }

    /// Run `f` as one atomic unit.
    ///
    /// # Postconditions
    /// - If `f` returns `Ok` and the commit succeeds, every write is visible
    /// - Otherwise no write is visible, in memory or durably
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut guard = self.lock()?;
        let mut tx = Transaction {
            state: guard.clone(),
            batch: WriteBatch::default(),
        };

        let value = f(&mut tx)?;

        if !tx.batch.is_empty() {
            if let Err(e) = self.backend.commit(&tx.batch, &tx.state) {
                error!("Store commit failed on {} backend: {}", self.backend.name(), e);
                return Err(e);
            }
            *guard = tx.state;
        }

        Ok(value)
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.lock()?.clone())
    }

    /// All records in id order.
    pub fn list(&self) -> Result<Vec<Record>> {
        Ok(self.lock()?.records().cloned().collect())
    }

    /// Get a record, following temporary-id aliases.
    ///
    /// # Errors
    /// - `NotFound` if no such record exists
    pub fn get(&self, id: &RecordId) -> Result<Record> {
        let state = self.lock()?;
        let id = state.resolve(id);
        state
            .record(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Record {}", id)))
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: Record) -> Result<()> {
        self.transaction(|tx| {
            tx.upsert(record);
            Ok(())
        })
    }

    /// Remove a record; returns it if it existed.
    pub fn remove(&self, id: &RecordId) -> Result<Option<Record>> {
        self.transaction(|tx| Ok(tx.remove(id)))
    }

    /// Replace the whole record set.
    pub fn replace_all(&self, records: Vec<Record>) -> Result<()> {
        self.transaction(|tx| {
            tx.replace_all(records);
            Ok(())
        })
    }

    /// Enqueue an intent, coalescing with any pending operation for the record.
    ///
    /// Returns the operation now pending for the record, if any.
    pub fn enqueue(
        &self,
        record_id: RecordId,
        kind: OperationKind,
    ) -> Result<Option<PendingOperation>> {
        self.transaction(|tx| tx.enqueue(record_id, kind))
    }

    /// Remove an operation after confirmed remote success.
    pub fn ack(&self, op_id: &OperationId) -> Result<()> {
        self.transaction(|tx| {
            tx.ack(op_id)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("Pending operation {}", op_id)))
        })
    }

    /// Record a failed attempt; the operation stays queued.
    pub fn fail(&self, op_id: &OperationId, error: &str) -> Result<()> {
        self.transaction(|tx| tx.fail(op_id, error))
    }

    /// Pending operations, oldest first.
    pub fn list_pending(&self) -> Result<Vec<PendingOperation>> {
        Ok(self.lock()?.pending().into_iter().cloned().collect())
    }

    pub fn operation(&self, op_id: &OperationId) -> Result<Option<PendingOperation>> {
        Ok(self.lock()?.operation(op_id).cloned())
    }

    /// The pending operation for a record, if any.
    pub fn pending_for(&self, record_id: &RecordId) -> Result<Option<PendingOperation>> {
        let state = self.lock()?;
        let id = state.resolve(record_id);
        Ok(state.operation_for(&id).cloned())
    }
}

/// Staged view of the store inside [`LocalStore::transaction`].
pub struct Transaction {
    state: Snapshot,
    batch: WriteBatch,
}

impl Transaction {
    /// The state as modified so far by this transaction.
    pub fn state(&self) -> &Snapshot {
        &self.state
    }

    /// Follow a temporary-id alias, if any.
    pub fn resolve(&self, id: &RecordId) -> RecordId {
        self.state.resolve(id)
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.state.record(id)
    }

    /// Get a copy of a record or fail with `NotFound`.
    pub fn require(&self, id: &RecordId) -> Result<Record> {
        self.get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Record {}", id)))
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.state.records()
    }

    pub fn upsert(&mut self, record: Record) {
        self.batch
            .records
            .insert(record.id.clone(), Some(record.clone()));
        self.state.put_record(record);
    }

    pub fn remove(&mut self, id: &RecordId) -> Option<Record> {
        let removed = self.state.delete_record(id);
        if removed.is_some() {
            self.batch.records.insert(id.clone(), None);
            self.prune_aliases(id);
        }
        removed
    }

    /// Replace the whole record set with `records`.
    pub fn replace_all(&mut self, records: Vec<Record>) {
        let keep: std::collections::BTreeSet<RecordId> =
            records.iter().map(|r| r.id.clone()).collect();
        let stale: Vec<RecordId> = self
            .state
            .records()
            .filter(|r| !keep.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();

        for id in stale {
            self.remove(&id);
        }
        for record in records {
            if self.state.record(&record.id) != Some(&record) {
                self.upsert(record);
            }
        }
    }

    pub fn operation(&self, op_id: &OperationId) -> Option<&PendingOperation> {
        self.state.operation(op_id)
    }

    pub fn operation_for(&self, record_id: &RecordId) -> Option<&PendingOperation> {
        self.state.operation_for(record_id)
    }

    /// Pending operations, oldest first.
    pub fn list_pending(&self) -> Vec<PendingOperation> {
        self.state.pending().into_iter().cloned().collect()
    }

    fn put_operation(&mut self, op: PendingOperation) {
        self.batch.operations.insert(op.id, Some(op.clone()));
        self.state.put_operation(op);
    }

    fn delete_operation(&mut self, op_id: &OperationId) -> Option<PendingOperation> {
        let removed = self.state.delete_operation(op_id);
        if let Some(op) = &removed {
            self.batch.operations.insert(*op_id, None);
            self.prune_aliases(&op.record_id);
        }
        removed
    }

    /// Forget the temporary ids of `id` once neither a record nor an
    /// operation refers to it.
    fn prune_aliases(&mut self, id: &RecordId) {
        if id.is_temporary()
            || self.state.record(id).is_some()
            || self.state.operation_for(id).is_some()
        {
            return;
        }
        for temporary in self.state.aliases_to(id) {
            self.state.delete_alias(&temporary);
            self.batch.aliases.insert(temporary, None);
        }
    }

    /// Enqueue an intent, coalescing with the record's pending operation.
    ///
    /// Returns the operation now pending for the record; `None` when the intent
    /// cancelled the existing operation or needs no remote call at all.
    ///
    /// # Errors
    /// - `RecordAlreadyDeleting` if a delete is already pending
    /// - `InvalidInput` for an intent that cannot follow the pending one
    pub fn enqueue(
        &mut self,
        record_id: RecordId,
        kind: OperationKind,
    ) -> Result<Option<PendingOperation>> {
        let existing = self.state.operation_for(&record_id).cloned();

        let step = match coalesce(&record_id, existing.as_ref().map(|op| &op.kind), kind) {
            Ok(step) => step,
            Err(e) => {
                warn!("Rejected intent for {}: {}", record_id, e);
                return Err(e);
            }
        };

        match (step, existing) {
            (CoalesceStep::Append(kind), _) => {
                let sequence = self.state.take_sequence();
                self.batch.next_sequence = Some(self.state.next_sequence());
                let op = PendingOperation::new(record_id, kind, sequence);
                debug!("Queued {} for {} as {}", op.kind.label(), op.record_id, op.id);
                self.put_operation(op.clone());
                Ok(Some(op))
            }
            (CoalesceStep::Merge(kind), Some(mut op)) => {
                op.supersede(kind);
                debug!(
                    "Coalesced intent for {} into {} ({}, revision {})",
                    op.record_id,
                    op.id,
                    op.kind.label(),
                    op.revision
                );
                self.put_operation(op.clone());
                Ok(Some(op))
            }
            (CoalesceStep::Cancel, Some(op)) => {
                debug!("Cancelled {} for {}", op.id, op.record_id);
                self.delete_operation(&op.id);
                Ok(None)
            }
            (CoalesceStep::Skip, _) => Ok(None),
            (CoalesceStep::Merge(_) | CoalesceStep::Cancel, None) => Err(Error::Storage(
                "Coalescing produced a merge without an existing operation".to_string(),
            )),
        }
    }

    /// Remove an operation unconditionally.
    pub fn ack(&mut self, op_id: &OperationId) -> Option<PendingOperation> {
        self.delete_operation(op_id)
    }

    /// Remove an operation only if no newer intent was coalesced into it.
    pub fn ack_revision(&mut self, op_id: &OperationId, revision: u32) -> AckOutcome {
        match self.state.operation(op_id) {
            None => AckOutcome::Missing,
            Some(op) if op.revision != revision => AckOutcome::Superseded(op.clone()),
            Some(_) => {
                self.delete_operation(op_id);
                AckOutcome::Acknowledged
            }
        }
    }

    /// Drop an operation without it having been applied remotely.
    pub fn cancel(&mut self, op_id: &OperationId) -> Option<PendingOperation> {
        self.delete_operation(op_id)
    }

    /// Record a failed attempt; the operation stays queued.
    ///
    /// # Errors
    /// - `NotFound` if the operation no longer exists
    pub fn fail(&mut self, op_id: &OperationId, error: &str) -> Result<()> {
        let mut op = self
            .state
            .operation(op_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Pending operation {}", op_id)))?;
        op.mark_failed(error);
        self.put_operation(op);
        Ok(())
    }

    /// Replace the payload of a pending operation, bumping its revision.
    ///
    /// # Errors
    /// - `NotFound` if the operation no longer exists
    pub fn rewrite(&mut self, op_id: &OperationId, kind: OperationKind) -> Result<PendingOperation> {
        let mut op = self
            .state
            .operation(op_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Pending operation {}", op_id)))?;
        op.supersede(kind);
        self.put_operation(op.clone());
        Ok(op)
    }

    /// Move a record and its pending operation from a temporary id to the
    /// server-assigned id, remembering the old id as an alias.
    ///
    /// # Errors
    /// - `InvalidInput` unless `from` is temporary and `to` permanent
    pub fn rekey(&mut self, from: &RecordId, to: RecordId) -> Result<()> {
        if !from.is_temporary() || to.is_temporary() {
            return Err(Error::InvalidInput(format!(
                "Cannot re-key {} to {}",
                from, to
            )));
        }

        if let Some(mut record) = self.remove(from) {
            record.id = to.clone();
            self.upsert(record);
        }
        if let Some(mut op) = self.state.operation_for(from).cloned() {
            op.record_id = to.clone();
            self.put_operation(op);
        }

        self.batch.aliases.insert(from.clone(), Some(to.clone()));
        self.state.put_alias(from.clone(), to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::record::SyncState;
    use proptest::prelude::*;
    use serde_json::json;
    use shelfsync_common::FieldMap;

    fn fields(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn open() -> (LocalStore, MemoryBackend) {
        let backend = MemoryBackend::new();
        let store = LocalStore::open(backend.clone()).unwrap();
        (store, backend)
    }

    #[test]
    fn test_record_and_intent_commit_together() {
        let (store, backend) = open();
        let record = Record::new_local(fields(&[("name", json!("lens"))]));
        let id = record.id.clone();

        store
            .transaction(|tx| {
                tx.upsert(record.clone());
                tx.enqueue(
                    id.clone(),
                    OperationKind::Create {
                        fields: record.fields.clone(),
                    },
                )
            })
            .unwrap();

        let committed = backend.committed().unwrap();
        assert!(committed.record(&id).is_some());
        assert!(committed.operation_for(&id).is_some());
        assert_eq!(backend.commit_count(), 1);
    }

    #[test]
    fn test_failed_commit_leaves_no_orphans() {
        let (store, backend) = open();
        backend.fail_next_commits(1);

        let record = Record::new_local(fields(&[("name", json!("lens"))]));
        let id = record.id.clone();
        let result = store.transaction(|tx| {
            tx.upsert(record.clone());
            tx.enqueue(
                id.clone(),
                OperationKind::Create {
                    fields: record.fields.clone(),
                },
            )
        });

        assert_eq!(result.unwrap_err().kind(), shelfsync_common::ErrorKind::StorageIo);
        assert!(store.list().unwrap().is_empty());
        assert!(store.list_pending().unwrap().is_empty());
        assert_eq!(backend.committed().unwrap().record_count(), 0);
    }

    #[test]
    fn test_closure_error_discards_writes() {
        let (store, backend) = open();
        let record = Record::new_synced(RecordId::permanent("1"), FieldMap::new());

        let result: Result<()> = store.transaction(|tx| {
            tx.upsert(record.clone());
            Err(Error::InvalidInput("abort".to_string()))
        });

        assert!(result.is_err());
        assert!(store.get(&RecordId::permanent("1")).is_err());
        assert_eq!(backend.commit_count(), 0);
    }

    #[test]
    fn test_two_updates_coalesce_into_one_operation() {
        let (store, _) = open();
        let id = RecordId::permanent("1");

        store
            .enqueue(id.clone(), OperationKind::update(fields(&[("camera", json!("5"))])))
            .unwrap();
        let op = store
            .enqueue(id.clone(), OperationKind::update(fields(&[("camera", json!("7"))])))
            .unwrap()
            .unwrap();

        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(op.revision, 1);
        let OperationKind::Update { values, .. } = &pending[0].kind else {
            panic!("expected update");
        };
        assert_eq!(values["camera"], json!("7"));
    }

    #[test]
    fn test_ack_and_fail() {
        let (store, _) = open();
        let op = store
            .enqueue(RecordId::permanent("1"), OperationKind::Delete)
            .unwrap()
            .unwrap();

        store.fail(&op.id, "timeout").unwrap();
        let pending = store.list_pending().unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));

        store.ack(&op.id).unwrap();
        assert!(store.list_pending().unwrap().is_empty());
        assert!(store.ack(&op.id).is_err());
    }

    #[test]
    fn test_ack_revision_detects_superseded() {
        let (store, _) = open();
        let id = RecordId::permanent("1");
        let dispatched = store
            .enqueue(id.clone(), OperationKind::update(fields(&[("camera", json!("5"))])))
            .unwrap()
            .unwrap();
        store
            .enqueue(id.clone(), OperationKind::update(fields(&[("camera", json!("7"))])))
            .unwrap();

        let outcome = store
            .transaction(|tx| Ok(tx.ack_revision(&dispatched.id, dispatched.revision)))
            .unwrap();
        assert!(matches!(outcome, AckOutcome::Superseded(_)));
        assert_eq!(store.list_pending().unwrap().len(), 1);
    }

    #[test]
    fn test_pending_is_fifo() {
        let (store, _) = open();
        for id in ["c", "a", "b"] {
            store
                .enqueue(RecordId::permanent(id), OperationKind::Delete)
                .unwrap();
        }
        let order: Vec<String> = store
            .list_pending()
            .unwrap()
            .iter()
            .map(|op| op.record_id.to_string())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_rekey_moves_record_operation_and_alias() {
        let (store, _) = open();
        let record = Record::new_local(fields(&[("name", json!("lens"))]));
        let tmp = record.id.clone();
        store
            .transaction(|tx| {
                tx.upsert(record.clone());
                tx.enqueue(tmp.clone(), OperationKind::Create { fields: record.fields.clone() })
            })
            .unwrap();

        let perm = RecordId::permanent("17");
        store.transaction(|tx| tx.rekey(&tmp, perm.clone())).unwrap();

        assert_eq!(store.get(&tmp).unwrap().id, perm);
        assert_eq!(store.pending_for(&tmp).unwrap().unwrap().record_id, perm);
        assert!(store
            .transaction(|tx| tx.rekey(&perm, RecordId::permanent("18")))
            .is_err());
    }

    #[test]
    fn test_alias_pruned_once_target_is_gone() {
        let (store, backend) = open();
        let record = Record::new_local(fields(&[("name", json!("lens"))]));
        let tmp = record.id.clone();
        let perm = RecordId::permanent("17");
        store
            .transaction(|tx| {
                tx.upsert(record.clone());
                tx.enqueue(tmp.clone(), OperationKind::Create { fields: record.fields.clone() })?;
                tx.rekey(&tmp, perm.clone())
            })
            .unwrap();

        // The queued operation still refers to the permanent id.
        store.remove(&perm).unwrap();
        assert_eq!(store.snapshot().unwrap().resolve(&tmp), perm);

        let op = store.pending_for(&perm).unwrap().unwrap();
        store.ack(&op.id).unwrap();
        assert_eq!(store.snapshot().unwrap().aliases().count(), 0);
        assert_eq!(backend.committed().unwrap().aliases().count(), 0);
        assert!(store.get(&tmp).is_err());
    }

    #[test]
    fn test_replace_all() {
        let (store, _) = open();
        store
            .upsert(Record::new_synced(RecordId::permanent("1"), FieldMap::new()))
            .unwrap();
        store
            .upsert(Record::new_synced(RecordId::permanent("2"), FieldMap::new()))
            .unwrap();

        store
            .replace_all(vec![Record::new_synced(
                RecordId::permanent("2"),
                fields(&[("name", json!("new"))]),
            )])
            .unwrap();

        let records = store.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields["name"], json!("new"));
        assert_eq!(records[0].sync_state, SyncState::Synced);
    }

    #[test]
    fn test_reopen_sees_committed_state() {
        let (store, backend) = open();
        store
            .enqueue(RecordId::permanent("1"), OperationKind::Delete)
            .unwrap();
        drop(store);

        let reopened = LocalStore::open(backend).unwrap();
        assert_eq!(reopened.list_pending().unwrap().len(), 1);
        let op = reopened
            .enqueue(RecordId::permanent("2"), OperationKind::Delete)
            .unwrap()
            .unwrap();
        assert_eq!(op.sequence, 1);
    }

    #[derive(Debug, Clone)]
    enum Intent {
        Set(usize, u8),
        Delete(usize),
    }

    fn intent() -> impl Strategy<Value = Intent> {
        prop_oneof![
            (0..3usize, any::<u8>()).prop_map(|(r, v)| Intent::Set(r, v)),
            (0..3usize).prop_map(Intent::Delete),
        ]
    }

    proptest! {
        #[test]
        fn prop_at_most_one_operation_per_record(intents in prop::collection::vec(intent(), 1..40)) {
            let (store, _) = open();
            let ids: Vec<RecordId> = (0..3).map(|i| RecordId::permanent(i.to_string())).collect();
            let mut latest: Vec<Option<u8>> = vec![None; 3];
            let mut deleting = vec![false; 3];

            for intent in intents {
                match intent {
                    Intent::Set(r, v) => {
                        let result = store.enqueue(
                            ids[r].clone(),
                            OperationKind::update(fields(&[("v", json!(v))])),
                        );
                        if deleting[r] {
                            prop_assert!(matches!(result, Err(Error::RecordAlreadyDeleting(_))));
                        } else {
                            prop_assert!(result.is_ok());
                            latest[r] = Some(v);
                        }
                    }
                    Intent::Delete(r) => {
                        let result = store.enqueue(ids[r].clone(), OperationKind::Delete);
                        prop_assert_eq!(result.is_ok(), !deleting[r]);
                        deleting[r] = true;
                    }
                }
            }

            let pending = store.list_pending().unwrap();
            for (r, id) in ids.iter().enumerate() {
                let ops: Vec<&PendingOperation> =
                    pending.iter().filter(|op| &op.record_id == id).collect();
                prop_assert!(ops.len() <= 1);
                match (ops.first().map(|op| &op.kind), deleting[r], latest[r]) {
                    (Some(OperationKind::Delete), true, _) => {}
                    (Some(OperationKind::Update { values, .. }), false, Some(v)) => {
                        prop_assert_eq!(&values["v"], &json!(v));
                    }
                    (None, false, None) => {}
                    other => prop_assert!(false, "unexpected queue state {:?}", other),
                }
            }
        }
    }
}
