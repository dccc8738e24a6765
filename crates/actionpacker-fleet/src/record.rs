// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner records: the authoritative fleet state.

use std::fmt;
use std::str::FromStr;

use actionpacker_github::{CredentialRef, RunnerScope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fleet-assigned runner identifier.
///
/// Distinct from the OS pid, the container id and GitHub's own runner id.
/// Identifiers are random and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunnerId(Uuid);

impl RunnerId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for RunnerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for RunnerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Which backend owns a runner's lifecycle. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerMode {
    /// Agent runs as a host process.
    Process,
    /// Agent runs inside a managed container.
    Container,
}

impl RunnerMode {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerMode::Process => "process",
            RunnerMode::Container => "container",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "process" => Some(RunnerMode::Process),
            "container" => Some(RunnerMode::Container),
            _ => None,
        }
    }
}

impl fmt::Display for RunnerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runner lifecycle status.
///
/// ```text
/// pending -> configuring -> starting -> running -> stopping -> stopped
///                                          |                     |
///                                          +--> orphaned         +--> starting
/// any -> error        any -> removed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    /// Record created, nothing done yet.
    Pending,
    /// Bundle download / image pull and agent registration in progress.
    Configuring,
    /// Process or container launch in progress.
    Starting,
    /// Backend resource confirmed alive.
    Running,
    /// Graceful stop in progress.
    Stopping,
    /// Backend resource exists but is not running.
    Stopped,
    /// Resources deleted. Terminal.
    Removed,
    /// Backend resource vanished while the GitHub registration persisted.
    Orphaned,
    /// A lifecycle step or reconciliation failed; see `last_error`.
    Error,
}

impl RunnerStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RunnerStatus; 9] = [
        RunnerStatus::Pending,
        RunnerStatus::Configuring,
        RunnerStatus::Starting,
        RunnerStatus::Running,
        RunnerStatus::Stopping,
        RunnerStatus::Stopped,
        RunnerStatus::Removed,
        RunnerStatus::Orphaned,
        RunnerStatus::Error,
    ];

    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Pending => "pending",
            RunnerStatus::Configuring => "configuring",
            RunnerStatus::Starting => "starting",
            RunnerStatus::Running => "running",
            RunnerStatus::Stopping => "stopping",
            RunnerStatus::Stopped => "stopped",
            RunnerStatus::Removed => "removed",
            RunnerStatus::Orphaned => "orphaned",
            RunnerStatus::Error => "error",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-native reference to a runner's process or container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendHandle {
    /// OS process (also the process group id).
    Process {
        /// Process id.
        pid: u32,
    },
    /// Container instance.
    Container {
        /// Full container id.
        container_id: String,
    },
}

impl BackendHandle {
    /// Mode this handle belongs to.
    pub fn mode(&self) -> RunnerMode {
        match self {
            BackendHandle::Process { .. } => RunnerMode::Process,
            BackendHandle::Container { .. } => RunnerMode::Container,
        }
    }

    /// Process id, if this is a process handle.
    pub fn pid(&self) -> Option<u32> {
        match self {
            BackendHandle::Process { pid } => Some(*pid),
            BackendHandle::Container { .. } => None,
        }
    }

    /// Container id, if this is a container handle.
    pub fn container_id(&self) -> Option<&str> {
        match self {
            BackendHandle::Process { .. } => None,
            BackendHandle::Container { container_id } => Some(container_id),
        }
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendHandle::Process { pid } => write!(f, "pid:{}", pid),
            BackendHandle::Container { container_id } => {
                write!(f, "container:{}", short_id(container_id))
            }
        }
    }
}

/// First 12 characters of a container id, as the docker CLI prints them.
pub fn short_id(container_id: &str) -> &str {
    container_id.get(..12).unwrap_or(container_id)
}

/// A runner owned by this fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerRecord {
    /// Fleet identifier.
    pub id: RunnerId,
    /// Name registered with GitHub.
    pub name: String,
    /// Backend. Write-once.
    pub mode: RunnerMode,
    /// Repository or organization the runner is registered against.
    pub scope: RunnerScope,
    /// Credential used to mint registration and removal tokens.
    pub credential: CredentialRef,
    /// Labels applied at registration.
    pub labels: Vec<String>,
    /// Container image (container mode only).
    pub image: Option<String>,
    /// Current status.
    pub status: RunnerStatus,
    /// Process or container handle, `None` until the resource exists.
    pub handle: Option<BackendHandle>,
    /// GitHub's runner id, once seen in a listing.
    pub remote_id: Option<i64>,
    /// Cause of the most recent failure.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Last successful start.
    pub started_at: Option<DateTime<Utc>>,
    /// Last time a reconciliation pass confirmed `status`.
    pub last_observed_at: Option<DateTime<Utc>>,
}

impl RunnerRecord {
    /// A new `pending` record.
    pub fn new(
        id: RunnerId,
        name: impl Into<String>,
        mode: RunnerMode,
        scope: RunnerScope,
        credential: CredentialRef,
        labels: Vec<String>,
        image: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            mode,
            scope,
            credential,
            labels,
            image,
            status: RunnerStatus::Pending,
            handle: None,
            remote_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            last_observed_at: None,
        }
    }

    /// Recorded pid, for process runners.
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(BackendHandle::pid)
    }

    /// Recorded container id, for container runners.
    pub fn container_id(&self) -> Option<&str> {
        self.handle.as_ref().and_then(BackendHandle::container_id)
    }
}

/// One status transition in a runner's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerEvent {
    /// Runner the event belongs to.
    pub runner_id: RunnerId,
    /// Previous status (`None` for the creation event).
    pub from_status: Option<RunnerStatus>,
    /// New status.
    pub to_status: RunnerStatus,
    /// Human-readable cause.
    pub detail: String,
    /// When the transition happened.
    pub created_at: DateTime<Utc>,
}

impl RunnerEvent {
    /// Event stamped with the current time.
    pub fn new(
        runner_id: RunnerId,
        from_status: Option<RunnerStatus>,
        to_status: RunnerStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            runner_id,
            from_status,
            to_status,
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }
}
