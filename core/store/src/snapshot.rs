//! In-memory image of the store and the write set of one transaction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use shelfsync_common::{OperationId, RecordId};

use crate::queue::PendingOperation;
use crate::record::Record;

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Complete state of a local store: records, queue, id aliases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "PersistedSnapshot", into = "PersistedSnapshot")]
pub struct Snapshot {
    records: BTreeMap<RecordId, Record>,
    operations: BTreeMap<OperationId, PendingOperation>,
    /// Temporary id -> server-assigned id, for confirmed creates.
    aliases: BTreeMap<RecordId, RecordId>,
    next_sequence: u64,
}

impl Snapshot {
    /// Assemble a snapshot from persisted parts.
    pub fn from_parts(
        records: impl IntoIterator<Item = Record>,
        operations: impl IntoIterator<Item = PendingOperation>,
        aliases: impl IntoIterator<Item = (RecordId, RecordId)>,
        next_sequence: u64,
    ) -> Self {
        let operations: BTreeMap<OperationId, PendingOperation> =
            operations.into_iter().map(|op| (op.id, op)).collect();
        // Never hand out a sequence already in use, whatever the stored counter says.
        let floor = operations
            .values()
            .map(|op| op.sequence + 1)
            .max()
            .unwrap_or(0);

        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            operations,
            aliases: aliases.into_iter().collect(),
            next_sequence: next_sequence.max(floor),
        }
    }

    /// All records in id order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn record(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// All pending operations in FIFO order.
    pub fn pending(&self) -> Vec<&PendingOperation> {
        let mut ops: Vec<&PendingOperation> = self.operations.values().collect();
        ops.sort_by_key(|op| op.sequence);
        ops
    }

    pub fn operation(&self, id: &OperationId) -> Option<&PendingOperation> {
        self.operations.get(id)
    }

    /// The pending operation targeting a record, if any.
    pub fn operation_for(&self, record_id: &RecordId) -> Option<&PendingOperation> {
        self.operations
            .values()
            .find(|op| &op.record_id == record_id)
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&RecordId, &RecordId)> {
        self.aliases.iter()
    }

    /// Follow a temporary id to the permanent id it was confirmed as.
    pub fn resolve(&self, id: &RecordId) -> RecordId {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub(crate) fn put_record(&mut self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    pub(crate) fn delete_record(&mut self, id: &RecordId) -> Option<Record> {
        self.records.remove(id)
    }

    pub(crate) fn put_operation(&mut self, op: PendingOperation) {
        self.operations.insert(op.id, op);
    }

    pub(crate) fn delete_operation(&mut self, id: &OperationId) -> Option<PendingOperation> {
        self.operations.remove(id)
    }

    pub(crate) fn put_alias(&mut self, temporary: RecordId, permanent: RecordId) {
        self.aliases.insert(temporary, permanent);
    }

    pub(crate) fn delete_alias(&mut self, temporary: &RecordId) -> Option<RecordId> {
        self.aliases.remove(temporary)
    }

    /// Temporary ids confirmed as `permanent`.
    pub(crate) fn aliases_to(&self, permanent: &RecordId) -> Vec<RecordId> {
        self.aliases
            .iter()
            .filter(|(_, target)| *target == permanent)
            .map(|(temporary, _)| temporary.clone())
            .collect()
    }

    pub(crate) fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

/// On-disk shape of a snapshot.
///
/// Maps keyed by tagged ids are flattened to lists so the document stays
/// valid JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSnapshot {
    version: u32,
    records: Vec<Record>,
    operations: Vec<PendingOperation>,
    #[serde(default)]
    aliases: Vec<(RecordId, RecordId)>,
    next_sequence: u64,
}

impl From<Snapshot> for PersistedSnapshot {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            records: snapshot.records.into_values().collect(),
            operations: snapshot.operations.into_values().collect(),
            aliases: snapshot.aliases.into_iter().collect(),
            next_sequence: snapshot.next_sequence,
        }
    }
}

impl From<PersistedSnapshot> for Snapshot {
    fn from(persisted: PersistedSnapshot) -> Self {
        Snapshot::from_parts(
            persisted.records,
            persisted.operations,
            persisted.aliases,
            persisted.next_sequence,
        )
    }
}

/// Writes staged by one transaction.
///
/// `None` marks a deletion; the last write to a key within a transaction wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub records: BTreeMap<RecordId, Option<Record>>,
    pub operations: BTreeMap<OperationId, Option<PendingOperation>>,
    pub aliases: BTreeMap<RecordId, Option<RecordId>>,
    pub next_sequence: Option<u64>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
            && self.operations.is_empty()
            && self.aliases.is_empty()
            && self.next_sequence.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OperationKind;
    use shelfsync_common::FieldMap;

    #[test]
    fn test_pending_is_fifo_by_sequence() {
        let mut snapshot = Snapshot::default();
        let seq_a = snapshot.take_sequence();
        let seq_b = snapshot.take_sequence();
        let b = PendingOperation::new(RecordId::permanent("b"), OperationKind::Delete, seq_b);
        let a = PendingOperation::new(RecordId::permanent("a"), OperationKind::Delete, seq_a);
        snapshot.put_operation(b);
        snapshot.put_operation(a);

        let order: Vec<String> = snapshot
            .pending()
            .iter()
            .map(|op| op.record_id.to_string())
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_resolve_follows_alias() {
        let mut snapshot = Snapshot::default();
        let tmp = RecordId::new_temporary();
        snapshot.put_alias(tmp.clone(), RecordId::permanent("9"));
        assert_eq!(snapshot.resolve(&tmp), RecordId::permanent("9"));
        assert_eq!(
            snapshot.resolve(&RecordId::permanent("1")),
            RecordId::permanent("1")
        );
    }

    #[test]
    fn test_from_parts_repairs_sequence_counter() {
        let op = PendingOperation::new(
            RecordId::new_temporary(),
            OperationKind::Create { fields: FieldMap::new() },
            41,
        );
        let snapshot = Snapshot::from_parts(Vec::new(), vec![op], Vec::new(), 3);
        assert_eq!(snapshot.next_sequence(), 42);
    }

    #[test]
    fn test_json_shape_round_trips() {
        let mut snapshot = Snapshot::default();
        snapshot.put_record(Record::new_local(FieldMap::new()));
        snapshot.put_alias(RecordId::new_temporary(), RecordId::permanent("5"));

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snapshot);
    }
}
