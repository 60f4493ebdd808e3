//! Common types used throughout ShelfSync.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Named field values of a record.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// Prefix used when a temporary id is rendered as text.
const TEMPORARY_PREFIX: &str = "tmp:";

/// Identifier of a record.
///
/// A record created locally carries a `Temporary` id until the remote store
/// confirms the create and assigns a `Permanent` one. The two namespaces are
/// distinguished by the variant, never by the shape of the value, so a
/// permanent id `"7"` and a temporary id never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordId {
    /// Server-assigned id.
    Permanent(String),
    /// Client-generated id for a record the remote has not confirmed yet.
    Temporary(Uuid),
}

impl RecordId {
    /// Generate a fresh temporary id.
    ///
    /// Uses a time-ordered UUID so temporary records sort in creation order.
    pub fn new_temporary() -> Self {
        RecordId::Temporary(Uuid::now_v7())
    }

    /// Wrap a server-assigned id.
    pub fn permanent(id: impl Into<String>) -> Self {
        RecordId::Permanent(id.into())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, RecordId::Temporary(_))
    }

    /// The server-assigned id, if this is a permanent id.
    pub fn as_permanent(&self) -> Option<&str> {
        match self {
            RecordId::Permanent(id) => Some(id),
            RecordId::Temporary(_) => None,
        }
    }

    /// Parse a textual id.
    ///
    /// `tmp:<uuid>` denotes a temporary id; anything else is a permanent id.
    /// Only text that displays back unchanged is accepted.
    ///
    /// # Errors
    /// - Empty input, or input with surrounding whitespace
    /// - `tmp:` prefix followed by anything but a lowercase hyphenated UUID
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "Record id cannot be empty".to_string(),
            ));
        }
        if s.trim() != s {
            return Err(crate::Error::InvalidInput(format!(
                "Record id has surrounding whitespace: {:?}",
                s
            )));
        }
        let Some(rest) = s.strip_prefix(TEMPORARY_PREFIX) else {
            return Ok(RecordId::Permanent(s.to_string()));
        };

        let uuid = Uuid::parse_str(rest)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid temporary id: {}", e)))?;
        if uuid.hyphenated().to_string() != rest {
            return Err(crate::Error::InvalidInput(format!(
                "Temporary id is not in canonical form: {}",
                s
            )));
        }
        Ok(RecordId::Temporary(uuid))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Permanent(id) => write!(f, "{}", id),
            RecordId::Temporary(uuid) => write!(f, "{}{}", TEMPORARY_PREFIX, uuid),
        }
    }
}

impl FromStr for RecordId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

/// Unique identifier for a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid operation id: {}", e)))
    }
}
