// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status synchronization: converge a runner's record with what its backend
//! and GitHub report.
//!
//! Three views are compared: the recorded status, the backend observation
//! (process or container liveness) and the hosting view (is a runner with
//! this name still listed). Resolution, in priority order:
//!
//! 1. Resource missing: `orphaned` if still registered, otherwise `removed`.
//! 2. Resource running but not registered (after the registration grace
//!    window): `error`, never silently re-registered.
//! 3. Otherwise the observed state wins.
//!
//! Synchronization only writes records. It never starts or stops anything.

use std::collections::HashMap;
use std::time::Duration;

use actionpacker_github::{CredentialRef, RemoteRunner, RunnerScope};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::backend::Observation;
use crate::engine::FleetEngine;
use crate::error::{Error, Result};
use crate::record::{BackendHandle, RunnerId, RunnerMode, RunnerRecord, RunnerStatus};

/// What GitHub says about a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostingView {
    /// Listed under the runner's scope.
    Registered {
        /// GitHub's runner id.
        remote_id: i64,
    },
    /// Listing succeeded and the runner is not in it.
    NotRegistered,
    /// Listing failed.
    Unknown,
}

impl HostingView {
    /// View of `record` within a scope listing (`None` when the listing failed).
    pub fn from_listing(listing: Option<&[RemoteRunner]>, record: &RunnerRecord) -> Self {
        let Some(listing) = listing else {
            return HostingView::Unknown;
        };
        listing
            .iter()
            .find(|r| r.name == record.name)
            .map(|r| HostingView::Registered { remote_id: r.id })
            .unwrap_or(HostingView::NotRegistered)
    }
}

/// Which pass a synchronization belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Periodic or on-demand pass. Unresolvable runners keep their status.
    Periodic,
    /// Startup pass. Every runner must end in a settled status.
    Startup,
}

/// Outcome of the resolution policy for one runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Status the record should have.
    pub status: RunnerStatus,
    /// Handle the record should carry.
    pub handle: Option<BackendHandle>,
    /// Event detail, and the error text when `status` is `error`.
    pub detail: String,
}

/// Apply the resolution policy.
///
/// `live_handle` is the handle the backend found, if any.
pub fn resolve(
    record: &RunnerRecord,
    observation: &Observation,
    live_handle: Option<BackendHandle>,
    hosting: &HostingView,
    phase: SyncPhase,
    registration_grace: Duration,
    now: DateTime<Utc>,
) -> Resolution {
    match observation {
        Observation::Missing => match (hosting, phase) {
            (HostingView::Registered { .. }, _) => Resolution {
                status: RunnerStatus::Orphaned,
                handle: None,
                detail: "backend resource gone, registration still listed".to_string(),
            },
            (HostingView::NotRegistered, _) => Resolution {
                status: RunnerStatus::Removed,
                handle: None,
                detail: "backend resource gone and not registered".to_string(),
            },
            (HostingView::Unknown, SyncPhase::Periodic) => Resolution {
                status: record.status,
                handle: record.handle.clone(),
                detail: "backend resource gone, registration unknown".to_string(),
            },
            (HostingView::Unknown, SyncPhase::Startup) => Resolution {
                status: RunnerStatus::Error,
                handle: None,
                detail: Error::ReconciliationIncomplete {
                    runner_id: record.id,
                    reason: "backend resource gone and GitHub listing unavailable".to_string(),
                }
                .to_string(),
            },
        },
        Observation::Running => {
            if *hosting == HostingView::NotRegistered
                && grace_elapsed(record.started_at, registration_grace, now)
            {
                Resolution {
                    status: RunnerStatus::Error,
                    handle: live_handle,
                    detail: Error::RegistrationLost(record.id).to_string(),
                }
            } else {
                Resolution {
                    status: RunnerStatus::Running,
                    handle: live_handle,
                    detail: "backend resource running".to_string(),
                }
            }
        }
        Observation::Stopped => Resolution {
            status: RunnerStatus::Stopped,
            handle: match record.mode {
                // A pid is meaningless once the process is gone
                RunnerMode::Process => None,
                RunnerMode::Container => live_handle,
            },
            detail: "backend resource not running".to_string(),
        },
    }
}

fn grace_elapsed(started_at: Option<DateTime<Utc>>, grace: Duration, now: DateTime<Utc>) -> bool {
    let Some(started_at) = started_at else {
        return true;
    };
    let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
    started_at
        .checked_add_signed(grace)
        .is_none_or(|deadline| deadline < now)
}

/// GitHub listings fetched during one pass, one per scope and credential.
#[derive(Default)]
pub(crate) struct ListingCache {
    listings: HashMap<(RunnerScope, CredentialRef), Option<Vec<RemoteRunner>>>,
}

impl FleetEngine {
    /// Re-derive one runner's status from its backend and GitHub.
    ///
    /// `removed` and `error` runners are returned unchanged. Fails with
    /// `ContainerRuntimeUnavailable` for container runners while the runtime
    /// is unreachable.
    pub async fn sync_runner_status(&self, id: RunnerId) -> Result<RunnerRecord> {
        self.ensure_ready()?;
        let _guard = self.locks.acquire(id, self.config.operation_timeout).await?;
        let mut record = self.load(id).await?;

        if matches!(record.status, RunnerStatus::Removed | RunnerStatus::Error) {
            return Ok(record);
        }
        if record.mode == RunnerMode::Container {
            self.containers.ensure_available().await?;
        }

        let listing = self.fetch_listing(&record).await;
        let hosting = HostingView::from_listing(listing.as_deref(), &record);
        self.sync_locked(&mut record, &hosting, SyncPhase::Periodic)
            .await?;
        Ok(record)
    }

    /// [`FleetEngine::sync_runner_status`] for a container-mode runner.
    pub async fn sync_docker_runner_status(&self, id: RunnerId) -> Result<RunnerRecord> {
        let record = self.load(id).await?;
        if record.mode != RunnerMode::Container {
            return Err(Error::InvalidState {
                runner_id: id,
                status: record.status,
                operation: "sync container status of",
            });
        }
        self.sync_runner_status(id).await
    }

    /// Observe, resolve and write. Caller holds the runner's lock.
    pub(crate) async fn sync_locked(
        &self,
        record: &mut RunnerRecord,
        hosting: &HostingView,
        phase: SyncPhase,
    ) -> Result<()> {
        let (observation, live_handle) = match record.mode {
            RunnerMode::Process => {
                let (observation, pid) = self.process.observe(record.id, record.pid());
                (observation, pid.map(|pid| BackendHandle::Process { pid }))
            }
            RunnerMode::Container => {
                let (observation, container_id) = self.containers.observe(record).await?;
                (
                    observation,
                    container_id.map(|container_id| BackendHandle::Container { container_id }),
                )
            }
        };

        let now = Utc::now();
        let resolution = resolve(
            record,
            &observation,
            live_handle,
            hosting,
            phase,
            self.config.registration_grace,
            now,
        );
        debug!(
            runner_id = %record.id,
            observation = ?observation,
            hosting = ?hosting,
            status = %resolution.status,
            "Resolved runner status"
        );

        if let HostingView::Registered { remote_id } = hosting {
            record.remote_id = Some(*remote_id);
        }
        record.last_observed_at = Some(now);
        record.handle = resolution.handle;

        if resolution.status == record.status {
            record.updated_at = now;
            return self.store.update(record).await;
        }

        warn!(
            runner_id = %record.id,
            recorded = %record.status,
            observed = %resolution.status,
            detail = %resolution.detail,
            "Runner drifted from recorded status"
        );
        if resolution.status == RunnerStatus::Error {
            record.last_error = Some(resolution.detail.clone());
        }
        self.transition(record, resolution.status, &resolution.detail)
            .await
    }

    /// The runner's scope listing, or `None` if it could not be fetched.
    pub(crate) async fn fetch_listing(&self, record: &RunnerRecord) -> Option<Vec<RemoteRunner>> {
        let timeout = self.config.operation_timeout;
        let fetch = async {
            let client = self.clients.client_for(&record.credential).await?;
            let listing = client.list_runners(&record.scope).await?;
            Ok::<_, Error>(listing)
        };

        match tokio::time::timeout(timeout, fetch).await {
            Ok(Ok(listing)) => Some(listing),
            Ok(Err(e)) => {
                warn!(
                    runner_id = %record.id,
                    scope = %record.scope,
                    error = %e,
                    "GitHub runner listing unavailable"
                );
                None
            }
            Err(_) => {
                warn!(
                    runner_id = %record.id,
                    scope = %record.scope,
                    "GitHub runner listing timed out"
                );
                None
            }
        }
    }

    /// [`FleetEngine::fetch_listing`] through a per-pass cache.
    pub(crate) async fn hosting_view_cached(
        &self,
        record: &RunnerRecord,
        cache: &mut ListingCache,
    ) -> HostingView {
        let key = (record.scope.clone(), record.credential.clone());
        if !cache.listings.contains_key(&key) {
            let listing = self.fetch_listing(record).await;
            cache.listings.insert(key.clone(), listing);
        }
        let listing = cache.listings.get(&key).and_then(Option::as_deref);
        HostingView::from_listing(listing, record)
    }
}
