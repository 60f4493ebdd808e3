//! In-memory remote store for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use shelfsync_common::{FieldMap, RemoteError, RemoteResult};

use crate::client::{RemoteClient, RemoteRecord};

/// Kind of a remote call, for failure injection and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Create,
    Update,
    UpdateField,
    Delete,
    List,
}

/// One call received by a [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Create(FieldMap),
    Update { id: String, fields: FieldMap },
    UpdateField { id: String, field: String, value: Value },
    Delete(String),
    List,
}

impl RemoteCall {
    pub fn kind(&self) -> CallKind {
        match self {
            RemoteCall::Create(_) => CallKind::Create,
            RemoteCall::Update { .. } => CallKind::Update,
            RemoteCall::UpdateField { .. } => CallKind::UpdateField,
            RemoteCall::Delete(_) => CallKind::Delete,
            RemoteCall::List => CallKind::List,
        }
    }

    fn record_id(&self) -> Option<&str> {
        match self {
            RemoteCall::Update { id, .. }
            | RemoteCall::UpdateField { id, .. }
            | RemoteCall::Delete(id) => Some(id),
            RemoteCall::Create(_) | RemoteCall::List => None,
        }
    }
}

#[derive(Default)]
struct State {
    records: BTreeMap<String, FieldMap>,
    next_id: u64,
    calls: Vec<RemoteCall>,
    /// One-shot failures, consumed in order per call kind.
    next_failures: HashMap<CallKind, VecDeque<RemoteError>>,
    /// Failures returned for every call touching a record id.
    record_failures: HashMap<String, RemoteError>,
    latency: Option<Duration>,
}

/// In-memory remote store.
///
/// Useful for testing and development. Ids are assigned sequentially starting
/// at 1. Every call is logged, and failures can be injected per call kind or
/// per record. Cloned handles share the same store.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

impl MemoryRemote {
    /// Create a new empty memory remote.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a record directly, bypassing the call log.
    pub fn insert(&self, id: impl Into<String>, fields: FieldMap) {
        let id = id.into();
        let mut state = self.state();
        if let Ok(n) = id.parse::<u64>() {
            state.next_id = state.next_id.max(n);
        }
        state.records.insert(id, fields);
    }

    /// Delete a record directly, as another client would.
    pub fn remove(&self, id: &str) -> Option<FieldMap> {
        self.state().records.remove(id)
    }

    /// Current contents of the store.
    pub fn records(&self) -> BTreeMap<String, FieldMap> {
        self.state().records.clone()
    }

    pub fn get(&self, id: &str) -> Option<FieldMap> {
        self.state().records.get(id).cloned()
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, kind: CallKind) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.kind() == kind)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Fail the next call of `kind` with `error`.
    pub fn fail_next(&self, kind: CallKind, error: RemoteError) {
        self.state()
            .next_failures
            .entry(kind)
            .or_default()
            .push_back(error);
    }

    /// Fail every call addressed to record `id` until cleared.
    pub fn fail_record(&self, id: impl Into<String>, error: RemoteError) {
        self.state().record_failures.insert(id.into(), error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.next_failures.clear();
        state.record_failures.clear();
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Log the call and return an injected failure, if any.
    async fn begin(&self, call: RemoteCall) -> RemoteResult<()> {
        let latency = {
            let mut state = self.state();
            debug!("Memory remote received {:?}", call);
            let injected = state
                .next_failures
                .get_mut(&call.kind())
                .and_then(|queue| queue.pop_front())
                .or_else(|| {
                    call.record_id()
                        .and_then(|id| state.record_failures.get(id).cloned())
                });
            state.calls.push(call);
            if let Some(error) = injected {
                return Err(error);
            }
            state.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

fn not_found(id: &str) -> RemoteError {
    RemoteError::permanent(format!("404 Not Found: record {}", id))
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, fields: &FieldMap) -> RemoteResult<RemoteRecord> {
        self.begin(RemoteCall::Create(fields.clone())).await?;

        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.records.insert(id.clone(), fields.clone());
        Ok(RemoteRecord::new(id, fields.clone()))
    }

    async fn update(&self, id: &str, fields: &FieldMap) -> RemoteResult<RemoteRecord> {
        self.begin(RemoteCall::Update {
            id: id.to_string(),
            fields: fields.clone(),
        })
        .await?;

        let mut state = self.state();
        let stored = state.records.get_mut(id).ok_or_else(|| not_found(id))?;
        *stored = fields.clone();
        Ok(RemoteRecord::new(id, stored.clone()))
    }

    async fn update_field(
        &self,
        id: &str,
        field: &str,
        value: &Value,
    ) -> RemoteResult<RemoteRecord> {
        self.begin(RemoteCall::UpdateField {
            id: id.to_string(),
            field: field.to_string(),
            value: value.clone(),
        })
        .await?;

        let mut state = self.state();
        let stored = state.records.get_mut(id).ok_or_else(|| not_found(id))?;
        stored.insert(field.to_string(), value.clone());
        Ok(RemoteRecord::new(id, stored.clone()))
    }

    async fn delete(&self, id: &str) -> RemoteResult<()> {
        self.begin(RemoteCall::Delete(id.to_string())).await?;

        self.state()
            .records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found(id))
    }

    async fn list(&self) -> RemoteResult<Vec<RemoteRecord>> {
        self.begin(RemoteCall::List).await?;

        Ok(self
            .state()
            .records
            .iter()
            .map(|(id, fields)| RemoteRecord::new(id.clone(), fields.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(name: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("name".to_string(), json!(name));
        fields
    }

    #[tokio::test]
    async fn test_crud() {
        let remote = MemoryRemote::new();

        let created = remote.create(&fields("lens")).await.unwrap();
        assert_eq!(created.id, "1");

        let updated = remote
            .update_field("1", "camera", &json!("5"))
            .await
            .unwrap();
        assert_eq!(updated.fields["camera"], json!("5"));
        assert_eq!(updated.fields["name"], json!("lens"));

        assert_eq!(remote.list().await.unwrap().len(), 1);
        remote.delete("1").await.unwrap();
        assert!(remote.list().await.unwrap().is_empty());

        assert_eq!(remote.call_count(CallKind::Create), 1);
        assert_eq!(remote.call_count(CallKind::List), 2);
    }

    #[tokio::test]
    async fn test_update_replaces_record() {
        let remote = MemoryRemote::new();
        let mut stored = fields("lens");
        stored.insert("camera".to_string(), json!("5"));
        remote.insert("1", stored);

        let updated = remote.update("1", &fields("Lens")).await.unwrap();
        assert_eq!(updated.fields, fields("Lens"));
        assert_eq!(remote.get("1"), Some(fields("Lens")));
    }

    #[tokio::test]
    async fn test_missing_record_is_permanent() {
        let remote = MemoryRemote::new();
        let err = remote.delete("42").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_seeded_ids_advance_counter() {
        let remote = MemoryRemote::new();
        remote.insert("7", fields("tripod"));
        let created = remote.create(&fields("lens")).await.unwrap();
        assert_eq!(created.id, "8");
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let remote = MemoryRemote::new();
        remote.insert("1", fields("lens"));

        remote.fail_next(CallKind::List, RemoteError::transient("timeout"));
        assert!(remote.list().await.unwrap_err().is_transient());
        assert!(remote.list().await.is_ok());

        remote.fail_record("1", RemoteError::permanent("422 invalid"));
        assert!(remote.update("1", &fields("x")).await.is_err());
        assert!(remote.delete("1").await.is_err());
        assert_eq!(remote.get("1"), Some(fields("lens")));

        remote.clear_failures();
        remote.delete("1").await.unwrap();
    }
}
