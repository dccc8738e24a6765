// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for actionpacker-fleet.

use std::fmt;

use actionpacker_github::{CredentialError, GitHubError};
use thiserror::Error;

use crate::backend::BackendError;
use crate::record::{RunnerId, RunnerStatus};

/// Step of a lifecycle operation, reported with every lifecycle failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStep {
    /// Host OS/architecture detection.
    DetectPlatform,
    /// Resolving `latest` to a concrete agent version.
    ResolveVersion,
    /// Agent bundle download and unpack.
    Download,
    /// Credential resolution.
    ResolveCredential,
    /// Registration token issuance.
    RegistrationToken,
    /// Agent configuration (`config.sh`).
    Configure,
    /// Agent launch.
    Start,
    /// Container image pull.
    PullImage,
    /// Container creation.
    CreateContainer,
    /// Graceful-then-forced stop.
    Stop,
    /// Removal token issuance.
    RemovalToken,
    /// De-registration from GitHub.
    Deregister,
    /// Working directory or container deletion.
    Cleanup,
    /// Status synchronization.
    Sync,
}

impl LifecycleStep {
    /// Stable name of the step.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStep::DetectPlatform => "detect_platform",
            LifecycleStep::ResolveVersion => "resolve_version",
            LifecycleStep::Download => "download",
            LifecycleStep::ResolveCredential => "resolve_credential",
            LifecycleStep::RegistrationToken => "registration_token",
            LifecycleStep::Configure => "configure",
            LifecycleStep::Start => "start",
            LifecycleStep::PullImage => "pull_image",
            LifecycleStep::CreateContainer => "create_container",
            LifecycleStep::Stop => "stop",
            LifecycleStep::RemovalToken => "removal_token",
            LifecycleStep::Deregister => "deregister",
            LifecycleStep::Cleanup => "cleanup",
            LifecycleStep::Sync => "sync",
        }
    }
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fleet errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// `start` was called on a runner that is already running.
    #[error("Runner {0} is already running")]
    AlreadyRunning(RunnerId),

    /// The backend resource is alive but GitHub no longer lists the runner.
    #[error("Runner {0} is running but no longer registered with GitHub")]
    RegistrationLost(RunnerId),

    /// Startup reconciliation could not resolve a runner.
    #[error("Reconciliation incomplete for runner {runner_id}: {reason}")]
    ReconciliationIncomplete {
        /// Runner that could not be resolved.
        runner_id: RunnerId,
        /// Why.
        reason: String,
    },

    /// Local resources were deleted but GitHub may still list the runner.
    #[error("Runner {runner_id} ({name}) may still be registered with GitHub: {source}")]
    DeregistrationIncomplete {
        /// Runner whose removal was cut short.
        runner_id: RunnerId,
        /// Name it is registered under.
        name: String,
        /// Why de-registration was not possible.
        #[source]
        source: Box<Error>,
    },

    /// Another record, live or removed, already uses this name.
    #[error("Runner name {name} is already used by runner {runner_id}")]
    NameInUse {
        /// Requested name.
        name: String,
        /// Runner holding it.
        runner_id: RunnerId,
    },

    /// No record with this id.
    #[error("Runner not found: {0}")]
    RunnerNotFound(RunnerId),

    /// An update tried to change a runner's mode.
    #[error("Mode of runner {0} is immutable")]
    ModeImmutable(RunnerId),

    /// A backend handle is already held by another runner.
    #[error("Backend handle conflict: {0}")]
    HandleConflict(String),

    /// The operation is not valid in the runner's current status.
    #[error("Cannot {operation} runner {runner_id} in status {status}")]
    InvalidState {
        /// Runner the operation targeted.
        runner_id: RunnerId,
        /// Status it was in.
        status: RunnerStatus,
        /// Operation name.
        operation: &'static str,
    },

    /// A stored record could not be decoded.
    #[error("Invalid runner record: {0}")]
    InvalidRecord(String),

    /// Lifecycle calls are rejected until startup reconciliation completes.
    #[error("Fleet engine is not ready: startup reconciliation has not completed")]
    NotReady,

    /// A bounded call ran out of time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Process or container backend failure.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Credential could not be resolved.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// GitHub API failure.
    #[error(transparent)]
    GitHub(#[from] GitHubError),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A lifecycle step failed for a runner.
    #[error("Runner {runner_id} failed at {step}: {source}")]
    Lifecycle {
        /// Runner the operation targeted.
        runner_id: RunnerId,
        /// Step that failed.
        step: LifecycleStep,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap `source` as a failure of `step` for `runner_id`.
    pub fn lifecycle(runner_id: RunnerId, step: LifecycleStep, source: impl Into<Error>) -> Self {
        Error::Lifecycle {
            runner_id,
            step,
            source: Box::new(source.into()),
        }
    }

    /// The innermost cause, looking through [`Error::Lifecycle`].
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Error::Lifecycle { source, .. } = err {
            err = source.as_ref();
        }
        err
    }

    /// Whether the failure is worth retrying on the next reconciliation pass.
    pub fn is_transient(&self) -> bool {
        match self.root() {
            Error::Timeout(_) => true,
            Error::Backend(e) => e.is_transient(),
            Error::GitHub(e) => e.is_transient(),
            Error::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

/// Result type using fleet Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_lifecycle() {
        let id = RunnerId::new();
        let err = Error::lifecycle(
            id,
            LifecycleStep::PullImage,
            BackendError::ImagePull {
                image: "ghcr.io/actions/actions-runner:latest".to_string(),
                message: "manifest unknown".to_string(),
            },
        );

        assert!(matches!(
            err.root(),
            Error::Backend(BackendError::ImagePull { .. })
        ));
        let message = err.to_string();
        assert!(message.contains(&id.to_string()));
        assert!(message.contains("pull_image"));
        assert!(message.contains("manifest unknown"));
    }

    #[test]
    fn test_transient_classification() {
        let id = RunnerId::new();
        assert!(Error::lifecycle(id, LifecycleStep::Sync, Error::Timeout("x".into())).is_transient());
        assert!(
            Error::GitHub(GitHubError::Api {
                status: 502,
                message: String::new()
            })
            .is_transient()
        );
        assert!(!Error::AlreadyRunning(id).is_transient());
        assert!(!Error::Credential(CredentialError::NotFound("x".into())).is_transient());
    }
}
