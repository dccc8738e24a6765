// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution backends.
//!
//! A runner's mode picks exactly one backend for its whole life:
//!
//! - [`process::ProcessBackend`] downloads the agent bundle, configures it
//!   with `config.sh` and supervises `run.sh` as a host process group.
//! - [`container::ContainerBackend`] pulls the agent image and supervises a
//!   labelled container through a [`docker::ContainerRuntime`].
//!
//! Backends never touch runner records. They report what they did or saw,
//! and the engine decides which status that means.

pub mod bundle;
pub mod container;
pub mod docker;
pub mod mock;
pub mod platform;
pub mod process;

use thiserror::Error;

/// Errors from the process and container backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// Host OS/architecture has no agent build.
    #[error("Unsupported platform: {os}/{arch}")]
    UnsupportedPlatform {
        /// `std::env::consts::OS`
        os: String,
        /// `std::env::consts::ARCH`
        arch: String,
    },

    /// Bundle download or verification failed.
    #[error("Agent download failed: {0}")]
    Download(String),

    /// `config.sh` rejected the registration or the working directory is missing.
    #[error("Agent configuration failed: {0}")]
    Configuration(String),

    /// The agent could not be launched or exited during the start probe.
    #[error("Agent start failed: {0}")]
    Start(String),

    /// Image pull failed.
    #[error("Failed to pull image {image}: {message}")]
    ImagePull {
        /// Image reference.
        image: String,
        /// Runtime output.
        message: String,
    },

    /// Container mode is disabled because the runtime cannot be reached.
    #[error("Container runtime unavailable: {0}")]
    ContainerRuntimeUnavailable(String),

    /// A container runtime command failed.
    #[error("Container runtime error: {0}")]
    ContainerRuntime(String),

    /// A bounded backend call ran out of time.
    #[error("Backend call timed out: {0}")]
    Timeout(String),

    /// Cancelled by the caller.
    #[error("Backend call cancelled")]
    Cancelled,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether retrying later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_)
                | BackendError::Download(_)
                | BackendError::ContainerRuntime(_)
        )
    }
}

/// Result type for backend calls.
pub type Result<T> = std::result::Result<T, BackendError>;

/// What a backend sees for a runner's resource right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Resource exists and is running.
    Running,
    /// Resource exists but is not running.
    Stopped,
    /// Resource does not exist at all.
    Missing,
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running.
    NotRunning,
    /// Exited within the grace period.
    Graceful,
    /// Force-terminated after the grace period.
    Forced,
}

/// Extract a bounded tail of `text` for error messages.
pub(crate) fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
