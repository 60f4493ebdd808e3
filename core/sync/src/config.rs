//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When reconciliation runs without being asked for explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Explicit requests only.
    Manual,
    /// Also on every offline to online transition.
    OnReconnect,
    /// Also at regular intervals.
    Periodic { interval: Duration },
    /// Both on reconnect and at regular intervals.
    Hybrid { interval: Duration },
}

impl SyncMode {
    pub fn syncs_on_reconnect(&self) -> bool {
        matches!(self, SyncMode::OnReconnect | SyncMode::Hybrid { .. })
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            SyncMode::Manual | SyncMode::OnReconnect => None,
        }
    }
}

/// Configuration for the sync coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on a single remote call; exceeding it is a transient failure.
    pub call_timeout: Duration,
    /// Trigger policy for the scheduler.
    pub sync_mode: SyncMode,
    /// Fetch and merge the authoritative snapshot after draining the queue.
    pub merge_after_drain: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            sync_mode: SyncMode::OnReconnect,
            merge_after_drain: true,
        }
    }
}
