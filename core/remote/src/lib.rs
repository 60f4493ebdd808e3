//! Remote store abstraction for ShelfSync.
//!
//! The sync engine talks to the authoritative store only through the
//! [`RemoteClient`] capability. Every failure it reports is already classified
//! as transient or permanent, so callers never inspect transport details.
//!
//! # Implementations
//! - [`MemoryRemote`]: in-process store with call log and failure injection
//! - [`HttpRemote`]: REST/JSON over `reqwest`

pub mod client;
pub mod http;
pub mod memory;

pub use client::{RemoteClient, RemoteRecord};
pub use http::{HttpRemote, HttpRemoteConfig};
pub use memory::{CallKind, MemoryRemote, RemoteCall};
