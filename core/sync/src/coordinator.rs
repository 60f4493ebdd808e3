//! Sync coordinator: drains the pending queue and merges the remote snapshot.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use shelfsync_common::{Error, FieldMap, RecordId, RemoteError, RemoteResult, Result};
use shelfsync_remote::{RemoteClient, RemoteRecord};
use shelfsync_store::{
    AckOutcome, LocalStore, OperationKind, PendingOperation, Record, SyncState, Transaction,
};

use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityTransition};
use crate::merge::merge_snapshot;
use crate::report::{OperationFailure, SyncReport, SyncStatus};

/// Whether a reconciliation is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Running,
}

/// Successful remote effect of one operation.
enum Applied {
    Created(RemoteRecord),
    Updated(RemoteRecord),
    Deleted,
}

/// Resets the phase when a run ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Orchestrates reconciliation between the local store and the remote store.
///
/// At most one reconciliation runs at a time: a call made while another is in
/// progress returns at once with [`SyncStatus::AlreadyRunning`]. Operations are
/// attempted once per run, oldest first; retrying happens only on a later run.
pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteClient>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    transitions: watch::Receiver<ConnectivityTransition>,
    config: SyncConfig,
    single_flight: tokio::sync::Mutex<()>,
    running: AtomicBool,
    last_report: Mutex<Option<SyncReport>>,
}

impl SyncCoordinator {
    /// Create a coordinator, subscribing to connectivity transitions.
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteClient>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        let transitions = connectivity.subscribe();
        Self {
            store,
            remote,
            connectivity,
            transitions,
            config,
            single_flight: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            last_report: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Connectivity transitions, from the subscription taken at construction.
    pub fn transitions(&self) -> watch::Receiver<ConnectivityTransition> {
        self.transitions.clone()
    }

    pub fn phase(&self) -> SyncPhase {
        if self.running.load(Ordering::SeqCst) {
            SyncPhase::Running
        } else {
            SyncPhase::Idle
        }
    }

    /// Report of the last run that was not rejected as already running.
    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run one reconciliation.
    ///
    /// # Postconditions
    /// - Every operation acknowledged remotely is gone from the queue
    /// - Transient failures stay queued with their attempt counter bumped
    /// - Permanent failures are dropped and reported; records keep their state
    /// - Settled records mirror the remote snapshot
    ///
    /// # Errors
    /// - Storage failures abort the run; remote failures never do
    pub async fn reconcile(&self) -> Result<SyncReport> {
        let Ok(_flight) = self.single_flight.try_lock() else {
            debug!("Reconciliation already running");
            return Ok(SyncReport::already_running());
        };
        self.running.store(true, Ordering::SeqCst);
        let _running = RunningGuard(&self.running);

        let started = Instant::now();
        let mut report = if self.connectivity.is_online() {
            info!("Reconciliation started against {} remote", self.remote.name());
            self.run(SyncReport::new(SyncStatus::Completed)).await?
        } else {
            debug!("Offline, skipping reconciliation");
            SyncReport::offline()
        };
        report.duration = started.elapsed();

        if report.status == SyncStatus::Completed {
            info!(
                "Reconciliation completed: {} attempted, {} succeeded, {} failed in {:?}",
                report.attempted, report.succeeded, report.failed, report.duration
            );
        }
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        Ok(report)
    }

    async fn run(&self, mut report: SyncReport) -> Result<SyncReport> {
        for queued in self.store.list_pending()? {
            if !self.connectivity.is_online() {
                warn!(
                    "Connectivity lost after {} operations, stopping",
                    report.attempted
                );
                report.status = SyncStatus::Offline;
                return Ok(report);
            }

            // The user may have coalesced or cancelled it since the listing.
            let Some(op) = self.store.operation(&queued.id)? else {
                continue;
            };

            let current = match self.store.get(&op.record_id) {
                Ok(record) => Some(record),
                Err(Error::NotFound(_)) => None,
                Err(e) => return Err(e),
            };

            report.attempted += 1;
            debug!("Dispatching {} {} for {}", op.kind.label(), op.id, op.record_id);

            match self.dispatch(&op, current.as_ref()).await {
                Ok(applied) => {
                    self.store.transaction(|tx| apply_success(tx, &op, applied))?;
                    report.succeeded += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!("{} for {} failed, keeping it: {}", op.id, op.record_id, err);
                        self.store.transaction(|tx| {
                            if tx.operation(&op.id).is_some() {
                                tx.fail(&op.id, err.message())?;
                            }
                            Ok(())
                        })?;
                    } else {
                        error!("{} for {} rejected: {}", op.id, op.record_id, err);
                        self.store
                            .transaction(|tx| apply_rejection(tx, &op, &err))?;
                    }
                    report.failed += 1;
                    report.errors.push(OperationFailure::new(
                        Some(op.id),
                        Some(op.record_id.clone()),
                        &err,
                    ));
                }
            }
        }

        if self.config.merge_after_drain {
            match self.call(self.remote.list()).await {
                Ok(records) => {
                    let stats = self
                        .store
                        .transaction(|tx| Ok(merge_snapshot(tx, records)))?;
                    debug!("Merged remote snapshot: {:?}", stats);
                    report.merge = Some(stats);
                }
                Err(err) => {
                    warn!("Snapshot fetch failed, skipping merge: {}", err);
                    report.errors.push(OperationFailure::new(None, None, &err));
                }
            }
        }

        Ok(report)
    }

    /// Bound a remote call by the configured timeout.
    async fn call<T>(&self, fut: impl Future<Output = RemoteResult<T>>) -> RemoteResult<T> {
        let limit: Duration = self.config.call_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::transient(format!(
                "Remote call timed out after {:?}",
                limit
            ))),
        }
    }

    /// Send one operation. A multi-field update replaces the whole remote
    /// record, so it carries every local field of `current`.
    async fn dispatch(
        &self,
        op: &PendingOperation,
        current: Option<&Record>,
    ) -> RemoteResult<Applied> {
        match &op.kind {
            OperationKind::Create { fields } => self
                .call(self.remote.create(fields))
                .await
                .map(Applied::Created),
            OperationKind::Update { values, .. } => {
                let id = permanent_id(op)?;
                let result = match single_field(values) {
                    Some((field, value)) => {
                        self.call(self.remote.update_field(id, field, value)).await
                    }
                    None => {
                        let body = whole_record(values, current);
                        self.call(self.remote.update(id, &body)).await
                    }
                };
                result.map(Applied::Updated)
            }
            OperationKind::Delete => {
                let id = permanent_id(op)?;
                self.call(self.remote.delete(id)).await?;
                Ok(Applied::Deleted)
            }
        }
    }
}

fn permanent_id(op: &PendingOperation) -> RemoteResult<&str> {
    op.record_id.as_permanent().ok_or_else(|| {
        RemoteError::permanent(format!(
            "{} addressed to unconfirmed record {}",
            op.kind.label(),
            op.record_id
        ))
    })
}

/// Local fields of the record overlaid with the queued values.
fn whole_record(values: &FieldMap, current: Option<&Record>) -> FieldMap {
    let mut body = current
        .map(|record| record.fields.clone())
        .unwrap_or_default();
    body.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
    body
}

fn single_field(values: &FieldMap) -> Option<(&String, &serde_json::Value)> {
    if values.len() == 1 {
        values.iter().next()
    } else {
        None
    }
}

/// Record a confirmed remote effect, respecting intents queued meanwhile.
fn apply_success(tx: &mut Transaction, dispatched: &PendingOperation, applied: Applied) -> Result<()> {
    let outcome = tx.ack_revision(&dispatched.id, dispatched.revision);

    match applied {
        Applied::Created(remote) => {
            let OperationKind::Create { fields: sent } = &dispatched.kind else {
                return Ok(());
            };
            confirm_create(tx, &dispatched.record_id, remote, sent)
        }
        Applied::Updated(remote) => {
            if outcome == AckOutcome::Acknowledged {
                if let Some(mut record) = tx.get(&dispatched.record_id).cloned() {
                    record.fields.extend(remote.fields);
                    record.mark_synced();
                    tx.upsert(record);
                }
            } else {
                debug!(
                    "{} for {} confirmed but superseded; newer values stay queued",
                    dispatched.id, dispatched.record_id
                );
            }
            Ok(())
        }
        Applied::Deleted => {
            if outcome == AckOutcome::Acknowledged {
                tx.remove(&dispatched.record_id);
            }
            Ok(())
        }
    }
}

/// Move a confirmed record to its server-assigned id.
///
/// Whatever the user did while the create was in flight is carried over: edits
/// become an update of the fields that differ from what was sent, and a local
/// delete becomes a delete of the new remote record.
fn confirm_create(
    tx: &mut Transaction,
    temporary: &RecordId,
    remote: RemoteRecord,
    sent: &FieldMap,
) -> Result<()> {
    let permanent = RecordId::permanent(remote.id);
    let exists_locally = tx.get(temporary).is_some();
    tx.rekey(temporary, permanent.clone())?;

    if !exists_locally {
        debug!("{} was deleted before its create was confirmed", temporary);
        if tx.operation_for(&permanent).is_none() {
            tx.enqueue(permanent, OperationKind::Delete)?;
        }
        return Ok(());
    }

    let mut record = tx.require(&permanent)?;
    let leftover = tx.operation_for(&permanent).cloned();

    match leftover {
        Some(op) => {
            let OperationKind::Create { fields: current } = &op.kind else {
                return Ok(());
            };
            let changed: FieldMap = current
                .iter()
                .filter(|(name, value)| sent.get(*name) != Some(*value))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();

            for (name, value) in remote.fields {
                record.fields.entry(name).or_insert(value);
            }
            if changed.is_empty() {
                tx.cancel(&op.id);
                record.mark_synced();
            } else {
                debug!(
                    "{} edited while its create was in flight, queueing update",
                    permanent
                );
                record.sync_state = SyncState::PendingUpdate(changed.keys().cloned().collect());
                tx.rewrite(&op.id, OperationKind::update(changed))?;
            }
        }
        None => {
            record.fields.extend(remote.fields);
            record.mark_synced();
        }
    }

    tx.upsert(record);
    Ok(())
}

/// Drop a rejected operation unless a newer intent was coalesced into it.
fn apply_rejection(tx: &mut Transaction, dispatched: &PendingOperation, err: &RemoteError) -> Result<()> {
    if let AckOutcome::Superseded(current) = tx.ack_revision(&dispatched.id, dispatched.revision) {
        tx.fail(&current.id, err.message())?;
    }
    Ok(())
}
