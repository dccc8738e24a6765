// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup reconciliation.
//!
//! Runs once before the engine accepts lifecycle calls. Every persisted
//! runner that is not `removed` or `error` is re-observed and resolved, so
//! that when the pass returns each one is either confirmed live or settled.
//! Runners whose operation was interrupted by the restart end in `error`.

use std::sync::atomic::Ordering;

use tracing::{error, info, warn};

use crate::backend::container::ContainerCapability;
use crate::engine::FleetEngine;
use crate::error::{Error, Result};
use crate::record::{RunnerMode, RunnerRecord, RunnerStatus};
use crate::status_sync::{ListingCache, SyncPhase};

/// Counts from a startup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    /// Runners examined.
    pub examined: usize,
    /// Confirmed running.
    pub running: usize,
    /// Ended stopped.
    pub stopped: usize,
    /// Ended orphaned.
    pub orphaned: usize,
    /// Ended removed.
    pub removed: usize,
    /// Ended in error, including unresolvable ones.
    pub errored: usize,
    /// `removed`/`error` runners left untouched.
    pub skipped: usize,
}

impl StartupReport {
    fn count(&mut self, status: RunnerStatus) {
        match status {
            RunnerStatus::Running => self.running += 1,
            RunnerStatus::Stopped => self.stopped += 1,
            RunnerStatus::Orphaned => self.orphaned += 1,
            RunnerStatus::Removed => self.removed += 1,
            _ => self.errored += 1,
        }
    }
}

impl FleetEngine {
    /// Re-synchronize every persisted runner and open the readiness gate.
    ///
    /// Fails only if the store cannot be read. Safe to call again: a second
    /// pass over an unchanged fleet writes no transitions.
    pub async fn initialize_runners_on_startup(&self) -> Result<StartupReport> {
        info!("Starting startup reconciliation");

        let docker_down = match self.containers.init_docker().await {
            ContainerCapability::Available(_) => None,
            ContainerCapability::Unavailable(reason) => Some(reason),
            ContainerCapability::Unknown => Some("container runtime not probed".to_string()),
        };

        let records = self.store.list_active().await?;
        let mut report = StartupReport::default();
        let mut cache = ListingCache::default();

        for mut record in records {
            report.examined += 1;
            if record.status == RunnerStatus::Error {
                report.skipped += 1;
                continue;
            }

            let _guard = match self.locks.acquire(record.id, self.config.operation_timeout).await {
                Ok(guard) => guard,
                Err(e) => {
                    error!(runner_id = %record.id, error = %e, "Could not lock runner during startup");
                    report.errored += 1;
                    continue;
                }
            };

            match self
                .reconcile_on_startup(&mut record, docker_down.as_deref(), &mut cache)
                .await
            {
                Ok(()) => report.count(record.status),
                Err(e) => {
                    let err = Error::ReconciliationIncomplete {
                        runner_id: record.id,
                        reason: e.to_string(),
                    };
                    self.settle_unresolved(&mut record, err).await?;
                    report.errored += 1;
                }
            }
        }

        self.ready.store(true, Ordering::SeqCst);
        info!(
            examined = report.examined,
            running = report.running,
            stopped = report.stopped,
            orphaned = report.orphaned,
            removed = report.removed,
            errored = report.errored,
            skipped = report.skipped,
            "Startup reconciliation complete"
        );
        Ok(report)
    }

    async fn reconcile_on_startup(
        &self,
        record: &mut RunnerRecord,
        docker_down: Option<&str>,
        cache: &mut ListingCache,
    ) -> Result<()> {
        if record.mode == RunnerMode::Container
            && let Some(reason) = docker_down
        {
            let err = Error::ReconciliationIncomplete {
                runner_id: record.id,
                reason: format!("container runtime unavailable: {}", reason),
            };
            return self.settle_unresolved(record, err).await;
        }

        // Provisioning never survives a restart; whatever it left behind is
        // cleaned up by remove
        if matches!(record.status, RunnerStatus::Pending | RunnerStatus::Configuring) {
            let err = Error::ReconciliationIncomplete {
                runner_id: record.id,
                reason: format!("{} interrupted by restart", record.status),
            };
            return self.settle_unresolved(record, err).await;
        }

        let hosting = self.hosting_view_cached(record, cache).await;
        self.sync_locked(record, &hosting, SyncPhase::Startup).await
    }

    /// Put a runner that could not be resolved into `error`.
    async fn settle_unresolved(&self, record: &mut RunnerRecord, err: Error) -> Result<()> {
        warn!(runner_id = %record.id, error = %err, "Runner unresolved at startup");
        if record.mode == RunnerMode::Process
            && let Some(pid) = record.pid()
            && !self.process.is_runner_process_alive(record.id, pid)
        {
            record.handle = None;
        }
        record.last_error = Some(err.to_string());
        self.transition(record, RunnerStatus::Error, &err.to_string())
            .await
    }
}
