//! Connectivity monitoring.

use tokio::sync::watch;
use tracing::info;

/// An online/offline status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityTransition {
    pub was_online: bool,
    pub is_online: bool,
}

impl ConnectivityTransition {
    /// True for an offline to online transition.
    pub fn came_online(&self) -> bool {
        !self.was_online && self.is_online
    }
}

/// Source of online/offline status.
///
/// Subscribers receive the latest transition through a `watch` channel, so a
/// slow subscriber observes only the most recent change.
pub trait ConnectivityMonitor: Send + Sync {
    fn is_online(&self) -> bool;

    fn subscribe(&self) -> watch::Receiver<ConnectivityTransition>;
}

/// Connectivity status set explicitly by the application.
pub struct ManualConnectivity {
    tx: watch::Sender<ConnectivityTransition>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(ConnectivityTransition {
            was_online: online,
            is_online: online,
        });
        Self { tx }
    }

    /// Set the status; subscribers are notified only on an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if current.is_online == online {
                return false;
            }
            *current = ConnectivityTransition {
                was_online: current.is_online,
                is_online: online,
            };
            true
        });
        if changed {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    /// Flip the status and return the new one.
    pub fn toggle(&self) -> bool {
        let online = !self.is_online();
        self.set_online(online);
        online
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn is_online(&self) -> bool {
        self.tx.borrow().is_online
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityTransition> {
        self.tx.subscribe()
    }
}
