//! Merging the authoritative snapshot into the local cache.

use std::collections::BTreeMap;

use shelfsync_common::{FieldMap, RecordId};
use shelfsync_remote::RemoteRecord;
use shelfsync_store::{Record, Transaction};

use crate::report::MergeStats;

/// Replace every settled record with its remote version.
///
/// A record is settled when it is `Synced` and has no pending operation.
/// Settled records missing remotely are removed; remote records unknown
/// locally are inserted unless an operation is still queued for their id.
/// Records with unresolved local changes are kept exactly as they are.
pub fn merge_snapshot(tx: &mut Transaction, remote: Vec<RemoteRecord>) -> MergeStats {
    let mut stats = MergeStats::default();
    let mut remote: BTreeMap<RecordId, FieldMap> = remote
        .into_iter()
        .map(|r| (RecordId::permanent(r.id), r.fields))
        .collect();

    let mut merged = Vec::new();
    for local in tx.records() {
        let upstream = remote.remove(&local.id);

        if local.is_pending() || tx.operation_for(&local.id).is_some() {
            stats.kept_pending += 1;
            merged.push(local.clone());
            continue;
        }

        match upstream {
            Some(fields) => {
                if fields != local.fields {
                    stats.refreshed += 1;
                }
                merged.push(Record::new_synced(local.id.clone(), fields));
            }
            None if local.id.is_temporary() => merged.push(local.clone()),
            None => stats.removed += 1,
        }
    }

    for (id, fields) in remote {
        if tx.operation_for(&id).is_some() {
            continue;
        }
        stats.inserted += 1;
        merged.push(Record::new_synced(id, fields));
    }

    tx.replace_all(merged);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shelfsync_store::{LocalStore, MemoryBackend, OperationKind, SyncState};

    fn fields(name: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("name".to_string(), json!(name));
        fields
    }

    fn store_with(records: Vec<Record>) -> LocalStore {
        let store = LocalStore::open(MemoryBackend::new()).unwrap();
        store.replace_all(records).unwrap();
        store
    }

    #[test]
    fn test_settled_records_follow_remote() {
        let store = store_with(vec![
            Record::new_synced(RecordId::permanent("1"), fields("old")),
            Record::new_synced(RecordId::permanent("2"), fields("gone")),
        ]);

        let stats = store
            .transaction(|tx| {
                Ok(merge_snapshot(
                    tx,
                    vec![
                        RemoteRecord::new("1", fields("new")),
                        RemoteRecord::new("3", fields("fresh")),
                    ],
                ))
            })
            .unwrap();

        assert_eq!(
            stats,
            MergeStats {
                refreshed: 1,
                inserted: 1,
                removed: 1,
                kept_pending: 0
            }
        );
        let ids: Vec<String> = store.list().unwrap().iter().map(|r| r.id.to_string()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(store.get(&RecordId::permanent("1")).unwrap().fields, fields("new"));
    }

    #[test]
    fn test_pending_records_are_untouched() {
        let mut edited = Record::new_synced(RecordId::permanent("1"), fields("mine"));
        edited.sync_state = SyncState::PendingUpdate(["name".to_string()].into());
        let local = Record::new_local(fields("draft"));
        let store = store_with(vec![edited.clone(), local.clone()]);

        let stats = store
            .transaction(|tx| Ok(merge_snapshot(tx, vec![RemoteRecord::new("1", fields("theirs"))])))
            .unwrap();

        assert_eq!(stats.kept_pending, 2);
        assert_eq!(store.get(&edited.id).unwrap(), edited);
        assert_eq!(store.get(&local.id).unwrap(), local);
    }

    #[test]
    fn test_remote_record_with_queued_delete_is_not_inserted() {
        let store = store_with(Vec::new());
        store
            .enqueue(RecordId::permanent("9"), OperationKind::Delete)
            .unwrap();

        let stats = store
            .transaction(|tx| Ok(merge_snapshot(tx, vec![RemoteRecord::new("9", fields("x"))])))
            .unwrap();

        assert_eq!(stats.inserted, 0);
        assert!(store.list().unwrap().is_empty());
    }
}
