//! Common utilities and types shared across ShelfSync modules.
//!
//! This module provides the identifier types and the error taxonomy used by the
//! record store, the remote collaborators and the sync coordinator, so that every
//! layer speaks the same classified language.

pub mod error;
pub mod types;

pub use error::{Error, ErrorKind, RemoteError, RemoteResult, Result};
pub use types::{FieldMap, OperationId, RecordId};
