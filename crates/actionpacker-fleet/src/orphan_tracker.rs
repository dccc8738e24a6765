// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orphan tracking: backend resources carrying this fleet's naming
//! convention with no active runner behind them.
//!
//! Orphans are discovered by scanning labelled containers and runner working
//! directories with a live pid file. They are terminated with the same
//! graceful-then-forced sequence as a normal stop and then forgotten. An
//! orphan never becomes a runner record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::backend::StopOutcome;
use crate::backend::process::RunnerProcess;
use crate::engine::FleetEngine;
use crate::error::Result;
use crate::record::{BackendHandle, RunnerId, RunnerMode, RunnerStatus, short_id};

/// Why a resource counts as an orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanReason {
    /// No record carries the runner id the resource is tagged with.
    NoRecord,
    /// The record is `removed` but the resource survived.
    RecordRemoved,
    /// The record belongs to the other backend.
    ModeMismatch,
}

impl OrphanReason {
    /// Label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrphanReason::NoRecord => "no_record",
            OrphanReason::RecordRemoved => "record_removed",
            OrphanReason::ModeMismatch => "mode_mismatch",
        }
    }
}

/// A tracked orphan. Held in memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanRecord {
    /// The resource.
    pub handle: BackendHandle,
    /// Runner id parsed from the resource's tag, if any.
    pub runner_id: Option<RunnerId>,
    /// Container name or working directory name.
    pub name: String,
    /// Working directory, for processes.
    pub work_dir: Option<PathBuf>,
    /// Why it is an orphan.
    pub reason: OrphanReason,
    /// When it was first seen.
    pub discovered_at: DateTime<Utc>,
}

/// Orphans found by reconciliation passes, keyed by handle.
#[derive(Default)]
pub struct OrphanTracker {
    orphans: DashMap<BackendHandle, OrphanRecord>,
}

impl OrphanTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `orphan`. Re-tracking a known handle keeps the first discovery time.
    pub fn track_orphaned_runner(&self, orphan: OrphanRecord) -> bool {
        let handle = orphan.handle.clone();
        let mut inserted = false;
        self.orphans.entry(handle).or_insert_with(|| {
            inserted = true;
            orphan
        });
        inserted
    }

    /// Forget an orphan.
    pub fn discard(&self, handle: &BackendHandle) -> Option<OrphanRecord> {
        self.orphans.remove(handle).map(|(_, orphan)| orphan)
    }

    /// Currently tracked orphans.
    pub fn list_orphans(&self) -> Vec<OrphanRecord> {
        self.orphans.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of tracked orphans.
    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }
}

/// Result of one orphan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    /// Orphans discovered this pass.
    pub discovered: usize,
    /// Orphans terminated this pass.
    pub stopped: usize,
    /// Orphans whose termination failed (kept for the next pass).
    pub failed: usize,
}

impl FleetEngine {
    /// Scan both backends for orphans and track them.
    ///
    /// Container scanning is skipped while the runtime is unavailable.
    pub async fn scan_orphans(&self) -> Result<usize> {
        let mut found = 0;

        if self.containers.is_docker_available().await {
            for summary in self.containers.list_actionpacker_containers().await? {
                let runner_id = summary.runner_id_label().and_then(|s| s.parse().ok());
                let Some(reason) = self.orphan_reason(runner_id, RunnerMode::Container).await? else {
                    continue;
                };
                let orphan = OrphanRecord {
                    handle: BackendHandle::Container {
                        container_id: summary.id.clone(),
                    },
                    runner_id,
                    name: summary.name.clone(),
                    work_dir: None,
                    reason,
                    discovered_at: Utc::now(),
                };
                if self.orphans.track_orphaned_runner(orphan) {
                    warn!(
                        container_id = %short_id(&summary.id),
                        name = %summary.name,
                        reason = reason.as_str(),
                        "Tracking orphaned container"
                    );
                }
                found += 1;
            }
        }

        for discovered in self.process.list_actionpacker_processes().await? {
            let runner_id = discovered.dir_name.parse().ok();
            let Some(reason) = self.orphan_reason(runner_id, RunnerMode::Process).await? else {
                continue;
            };
            let orphan = OrphanRecord {
                handle: BackendHandle::Process {
                    pid: discovered.process.pid,
                },
                runner_id,
                name: discovered.dir_name.clone(),
                work_dir: Some(discovered.process.work_dir.clone()),
                reason,
                discovered_at: Utc::now(),
            };
            if self.orphans.track_orphaned_runner(orphan) {
                warn!(
                    pid = discovered.process.pid,
                    dir = %discovered.dir_name,
                    reason = reason.as_str(),
                    "Tracking orphaned agent process"
                );
            }
            found += 1;
        }

        Ok(found)
    }

    /// Whether a resource tagged with `runner_id` is an orphan, and why.
    ///
    /// Resources of runners with an operation in flight are never orphans:
    /// the operation may be about to record their handle.
    async fn orphan_reason(
        &self,
        runner_id: Option<RunnerId>,
        mode: RunnerMode,
    ) -> Result<Option<OrphanReason>> {
        let Some(runner_id) = runner_id else {
            return Ok(Some(OrphanReason::NoRecord));
        };
        let Some(_guard) = self.locks.try_acquire(runner_id) else {
            debug!(runner_id = %runner_id, "Runner busy, skipping orphan check");
            return Ok(None);
        };

        Ok(match self.store.get(runner_id).await? {
            None => Some(OrphanReason::NoRecord),
            Some(record) if record.mode != mode => Some(OrphanReason::ModeMismatch),
            Some(record) if record.status == RunnerStatus::Removed => {
                Some(OrphanReason::RecordRemoved)
            }
            Some(_) => None,
        })
    }

    /// Terminate an orphan's resource and stop tracking it.
    ///
    /// Never touches runner records.
    pub async fn stop_orphaned_runner(&self, orphan: &OrphanRecord) -> Result<StopOutcome> {
        let outcome = match &orphan.handle {
            BackendHandle::Container { container_id } => {
                self.containers.destroy_container(container_id).await?
            }
            BackendHandle::Process { pid } => {
                let work_dir = orphan
                    .work_dir
                    .clone()
                    .unwrap_or_else(|| self.process.runners_dir().join(&orphan.name));
                self.process
                    .stop_orphan_process(&RunnerProcess {
                        pid: *pid,
                        work_dir,
                    })
                    .await?
            }
        };

        self.orphans.discard(&orphan.handle);
        info!(
            handle = %orphan.handle,
            name = %orphan.name,
            outcome = ?outcome,
            "Orphan terminated"
        );
        Ok(outcome)
    }

    /// Scan, then terminate every tracked orphan.
    pub async fn reap_orphans(&self) -> Result<OrphanReport> {
        let discovered = self.scan_orphans().await?;
        let mut report = OrphanReport {
            discovered,
            ..Default::default()
        };

        for orphan in self.orphans.list_orphans() {
            if orphan.handle.mode() == RunnerMode::Container
                && !self.containers.is_docker_available().await
            {
                continue;
            }
            match self.stop_orphaned_runner(&orphan).await {
                Ok(_) => report.stopped += 1,
                Err(e) => {
                    warn!(handle = %orphan.handle, error = %e, "Failed to terminate orphan");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orphan(pid: u32) -> OrphanRecord {
        OrphanRecord {
            handle: BackendHandle::Process { pid },
            runner_id: None,
            name: "leftover".to_string(),
            work_dir: None,
            reason: OrphanReason::NoRecord,
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn test_track_is_idempotent() {
        let tracker = OrphanTracker::new();
        let first = orphan(100);
        let first_seen = first.discovered_at;

        assert!(tracker.track_orphaned_runner(first));
        let mut again = orphan(100);
        again.discovered_at = first_seen + chrono::Duration::seconds(30);
        assert!(!tracker.track_orphaned_runner(again));

        let listed = tracker.list_orphans();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].discovered_at, first_seen);
    }

    #[test]
    fn test_discard() {
        let tracker = OrphanTracker::new();
        tracker.track_orphaned_runner(orphan(1));
        tracker.track_orphaned_runner(orphan(2));

        assert!(tracker.discard(&BackendHandle::Process { pid: 1 }).is_some());
        assert!(tracker.discard(&BackendHandle::Process { pid: 1 }).is_none());
        assert_eq!(tracker.len(), 1);
    }
}
