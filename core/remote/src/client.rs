//! Remote client trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use shelfsync_common::{FieldMap, RemoteResult};

/// A record as the authoritative store returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Server-assigned id, normalised to a string.
    pub id: String,
    /// Field values, excluding the id.
    pub fields: FieldMap,
}

impl RemoteRecord {
    pub fn new(id: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// CRUD capability against the authoritative store.
///
/// Implementations hold no sync state. Every call either succeeds or fails
/// with a [`RemoteError`](shelfsync_common::RemoteError) already classified as
/// transient (worth retrying on a later pass) or permanent (the store rejected
/// the request).
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Get the client name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Create a record.
    ///
    /// # Postconditions
    /// - Returns the stored record carrying its server-assigned id
    async fn create(&self, fields: &FieldMap) -> RemoteResult<RemoteRecord>;

    /// Replace a record with `fields`.
    ///
    /// # Errors
    /// - Permanent if the record does not exist
    async fn update(&self, id: &str, fields: &FieldMap) -> RemoteResult<RemoteRecord>;

    /// Update a single field of a record.
    async fn update_field(&self, id: &str, field: &str, value: &Value)
        -> RemoteResult<RemoteRecord>;

    /// Delete a record.
    ///
    /// # Errors
    /// - Permanent if the record does not exist
    async fn delete(&self, id: &str) -> RemoteResult<()>;

    /// Fetch the authoritative list of all records.
    async fn list(&self) -> RemoteResult<Vec<RemoteRecord>>;
}
