//! Sync scheduling - explicit, reconnect and periodic triggers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error, info};

use shelfsync_common::{Error, Result};

use crate::config::SyncMode;
use crate::connectivity::ConnectivityTransition;
use crate::report::SyncReport;

/// Why a reconciliation was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Explicitly requested.
    Requested,
    /// Connectivity came back.
    Reconnected,
    /// Periodic tick.
    Periodic,
}

/// Sync request types.
#[derive(Debug)]
enum SyncRequest {
    Sync,
    Shutdown,
}

type Reply = oneshot::Sender<Result<SyncReport>>;

/// Scheduler for managing sync timing and requests.
pub struct SyncScheduler {
    /// Current sync mode.
    mode: Arc<RwLock<SyncMode>>,
    /// Channel to send sync requests.
    request_tx: mpsc::Sender<(SyncRequest, Option<Reply>)>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Request a reconciliation and wait for its report.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Sync, Some(response_tx)))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Scheduler stopped before replying".to_string()))?
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the background loop after any reconciliation in progress.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send((SyncRequest::Shutdown, None)).await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<(SyncRequest, Option<Reply>)>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `sync_fn` is awaited for each
    /// trigger before the next one is taken, so triggers arriving during a run
    /// are served afterwards rather than overlapping it.
    pub async fn run<F, Fut>(
        mut self,
        mut transitions: watch::Receiver<ConnectivityTransition>,
        sync_fn: F,
    ) where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SyncReport>> + Send,
    {
        let mut period = self.mode.read().await.interval();
        let mut ticker = period.map(periodic);
        let mut connectivity_open = true;

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((SyncRequest::Sync, reply)) => {
                            let result = sync_fn(SyncTrigger::Requested).await;
                            if let Some(reply) = reply {
                                let _ = reply.send(result);
                            }
                        }
                        Some((SyncRequest::Shutdown, _)) | None => {
                            info!("Sync scheduler shutting down");
                            break;
                        }
                    }
                }

                changed = transitions.changed(), if connectivity_open => {
                    if changed.is_err() {
                        debug!("Connectivity monitor dropped");
                        connectivity_open = false;
                        continue;
                    }
                    let transition = *transitions.borrow_and_update();
                    let mode = self.mode.read().await.clone();
                    if transition.came_online() && mode.syncs_on_reconnect() {
                        debug!("Back online, triggering sync");
                        log_outcome("Reconnect", sync_fn(SyncTrigger::Reconnected).await);
                    }
                }

                _ = wait_for_tick(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    log_outcome("Periodic", sync_fn(SyncTrigger::Periodic).await);
                }
            }

            // Recreate the ticker if the mode changed
            let expected = self.mode.read().await.interval();
            if expected != period {
                period = expected;
                ticker = period.map(periodic);
            }
        }
    }
}

/// First tick one full period from now.
fn periodic(every: Duration) -> Interval {
    interval_at(Instant::now() + every, every)
}

async fn wait_for_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_outcome(trigger: &str, result: Result<SyncReport>) {
    match result {
        Ok(report) => info!(
            "{} sync finished ({:?}): {} succeeded, {} failed",
            trigger, report.status, report.succeeded, report.failed
        ),
        Err(e) => error!("{} sync failed: {}", trigger, e),
    }
}
