//! Cached records and their synchronization state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use shelfsync_common::{FieldMap, RecordId};

/// Synchronization state of a single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "fields", rename_all = "snake_case")]
pub enum SyncState {
    /// Matches the last authoritative snapshot.
    Synced,
    /// Created locally, not yet confirmed by the remote store.
    PendingCreate,
    /// Local edits to the named fields are not yet confirmed.
    PendingUpdate(BTreeSet<String>),
    /// Deleted locally, delete not yet confirmed. Accepts no further edits.
    PendingDelete,
}

impl SyncState {
    pub fn is_pending(&self) -> bool {
        !matches!(self, SyncState::Synced)
    }

    /// Short label for display and persistence.
    pub fn label(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::PendingCreate => "pending_create",
            SyncState::PendingUpdate(_) => "pending_update",
            SyncState::PendingDelete => "pending_delete",
        }
    }
}

/// A cached entity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub fields: FieldMap,
    pub sync_state: SyncState,
}

impl Record {
    /// Create a record that exists only locally.
    pub fn new_local(fields: FieldMap) -> Self {
        Self {
            id: RecordId::new_temporary(),
            fields,
            sync_state: SyncState::PendingCreate,
        }
    }

    /// Create a record mirroring the remote store.
    pub fn new_synced(id: RecordId, fields: FieldMap) -> Self {
        Self {
            id,
            fields,
            sync_state: SyncState::Synced,
        }
    }

    /// Apply field edits and track them in the sync state.
    ///
    /// Returns the names of the edited fields. A record that is still
    /// `PendingCreate` stays so; otherwise the edited names are unioned into
    /// `PendingUpdate`.
    pub fn apply_edits(&mut self, edits: &FieldMap) -> BTreeSet<String> {
        let changed: BTreeSet<String> = edits.keys().cloned().collect();
        for (name, value) in edits {
            self.fields.insert(name.clone(), value.clone());
        }

        self.sync_state = match std::mem::replace(&mut self.sync_state, SyncState::Synced) {
            SyncState::PendingCreate => SyncState::PendingCreate,
            SyncState::PendingUpdate(mut existing) => {
                existing.extend(changed.iter().cloned());
                SyncState::PendingUpdate(existing)
            }
            SyncState::Synced | SyncState::PendingDelete => {
                SyncState::PendingUpdate(changed.clone())
            }
        };

        changed
    }

    /// Mark as confirmed by the remote store.
    pub fn mark_synced(&mut self) {
        self.sync_state = SyncState::Synced;
    }

    pub fn is_pending(&self) -> bool {
        self.sync_state.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_new_local_is_pending_create() {
        let record = Record::new_local(fields(&[("name", json!("lens"))]));
        assert!(record.id.is_temporary());
        assert_eq!(record.sync_state, SyncState::PendingCreate);
    }

    #[test]
    fn test_edits_keep_pending_create() {
        let mut record = Record::new_local(fields(&[("name", json!("lens"))]));
        record.apply_edits(&fields(&[("camera", json!("5"))]));
        assert_eq!(record.sync_state, SyncState::PendingCreate);
        assert_eq!(record.fields["camera"], json!("5"));
    }

    #[test]
    fn test_edits_union_changed_fields() {
        let mut record = Record::new_synced(
            RecordId::permanent("1"),
            fields(&[("name", json!("lens")), ("camera", json!("1"))]),
        );
        record.apply_edits(&fields(&[("camera", json!("5"))]));
        record.apply_edits(&fields(&[("name", json!("tripod"))]));

        let expected: BTreeSet<String> = ["camera", "name"].iter().map(|s| s.to_string()).collect();
        assert_eq!(record.sync_state, SyncState::PendingUpdate(expected));
    }

    #[test]
    fn test_sync_state_serialization() {
        let state = SyncState::PendingUpdate(["camera".to_string()].into_iter().collect());
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"state":"pending_update","fields":["camera"]}"#);

        let restored: SyncState = serde_json::from_str(r#"{"state":"synced"}"#).unwrap();
        assert_eq!(restored, SyncState::Synced);
    }
}
