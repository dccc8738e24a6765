// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic reconciliation.
//!
//! One pass re-probes the container runtime, synchronizes every `running`,
//! `stopped` and `orphaned` runner, then scans for and terminates orphans.
//! Passes never overlap. Runners with a caller-driven operation in flight
//! are skipped and picked up by the next pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::engine::FleetEngine;
use crate::error::{Error, LifecycleStep, Result};
use crate::orphan_tracker::OrphanReport;
use crate::record::{RunnerMode, RunnerRecord, RunnerStatus};
use crate::status_sync::{ListingCache, SyncPhase};

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Runners synchronized.
    pub synced: usize,
    /// Runners whose status changed.
    pub changed: usize,
    /// Runners skipped (busy, or container runtime unavailable).
    pub skipped: usize,
    /// Runners whose synchronization failed.
    pub failed: usize,
    /// Orphan pass results.
    pub orphans: OrphanReport,
}

impl FleetEngine {
    /// Run one reconciliation pass.
    ///
    /// Waits for a pass already in progress to finish first. Fails with
    /// `NotReady` before startup reconciliation has completed.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        self.ensure_ready()?;
        let _pass = self.pass_guard.lock().await;

        let docker_available = self.containers.init_docker().await.is_available();
        let mut report = ReconcileReport::default();
        let mut cache = ListingCache::default();

        for record in self.store.list_active().await? {
            if !matches!(
                record.status,
                RunnerStatus::Running | RunnerStatus::Stopped | RunnerStatus::Orphaned
            ) {
                continue;
            }
            if record.mode == RunnerMode::Container && !docker_available {
                report.skipped += 1;
                continue;
            }

            match self.reconcile_runner(record, &mut cache).await {
                Ok(Some(changed)) => {
                    report.synced += 1;
                    if changed {
                        report.changed += 1;
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    if e.is_transient() {
                        warn!(error = %e, "Runner sync failed, retrying next pass");
                    } else {
                        error!(error = %e, "Runner sync failed");
                    }
                }
            }
        }

        match self.reap_orphans().await {
            Ok(orphans) => report.orphans = orphans,
            Err(e) => error!(error = %e, "Orphan pass failed"),
        }
        self.locks.prune();

        debug!(
            synced = report.synced,
            changed = report.changed,
            skipped = report.skipped,
            failed = report.failed,
            orphans_stopped = report.orphans.stopped,
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    /// Sync one runner if nobody else holds its lock. `None` when busy.
    async fn reconcile_runner(
        &self,
        record: RunnerRecord,
        cache: &mut ListingCache,
    ) -> Result<Option<bool>> {
        let Some(_guard) = self.locks.try_acquire(record.id) else {
            debug!(runner_id = %record.id, "Runner busy, skipping this pass");
            return Ok(None);
        };

        // Re-read under the lock; the listing snapshot may be stale
        let mut record = self.load(record.id).await?;
        if !matches!(
            record.status,
            RunnerStatus::Running | RunnerStatus::Stopped | RunnerStatus::Orphaned
        ) {
            return Ok(None);
        }

        let before = record.status;
        let hosting = self.hosting_view_cached(&record, cache).await;
        self.sync_locked(&mut record, &hosting, SyncPhase::Periodic)
            .await
            .map_err(|e| Error::lifecycle(record.id, LifecycleStep::Sync, e))?;
        Ok(Some(record.status != before))
    }
}

/// Configuration for the reconcile worker.
#[derive(Debug, Clone)]
pub struct ReconcileWorkerConfig {
    /// How often to run a pass.
    pub poll_interval: Duration,
}

impl Default for ReconcileWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Background worker that runs [`FleetEngine::reconcile_once`] on an interval.
pub struct ReconcileWorker {
    engine: Arc<FleetEngine>,
    config: ReconcileWorkerConfig,
    shutdown: Arc<Notify>,
}

impl ReconcileWorker {
    /// Create a new reconcile worker.
    pub fn new(engine: Arc<FleetEngine>, config: ReconcileWorkerConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run passes until the shutdown signal is received.
    ///
    /// A failed pass is logged and the loop carries on.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Reconcile worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconcile worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.engine.reconcile_once().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
            }
        }

        info!("Reconcile worker stopped");
    }
}
