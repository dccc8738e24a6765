// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for actionpacker-fleet.

use std::path::PathBuf;
use std::time::Duration;

/// Default agent container image.
pub const DEFAULT_RUNNER_IMAGE: &str = "ghcr.io/actions/actions-runner:latest";
/// Default agent bundle base URL.
pub const DEFAULT_DOWNLOAD_URL: &str = "https://github.com/actions/runner/releases/download";

/// Fleet configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Root for runner working directories, bundle cache and the default database
    pub data_dir: PathBuf,
    /// SQLite URL of the record store
    pub database_url: String,
    /// Interval between reconciliation passes
    pub reconcile_interval: Duration,
    /// Graceful stop window before forced termination
    pub stop_grace: Duration,
    /// Upper bound for a single backend step
    pub operation_timeout: Duration,
    /// Time after start before an unlisted running runner counts as lost
    pub registration_grace: Duration,
    /// Agent version, or `latest`
    pub runner_version: String,
    /// Agent bundle base URL
    pub download_url: String,
    /// Expected SHA-256 of the agent bundle, hex encoded
    pub runner_sha256: Option<String>,
    /// Default container image for container-mode runners
    pub runner_image: String,
    /// Container runtime CLI
    pub docker_bin: String,
    /// Prefix for runner and container names
    pub name_prefix: String,
    /// GitHub REST API base URL
    pub github_api_url: String,
    /// GitHub web base URL
    pub github_url: String,
    /// Token registered as the `default` credential
    pub github_token: Option<String>,
}

impl FleetConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir =
            PathBuf::from(var("ACTIONPACKER_DATA_DIR").unwrap_or_else(|| ".data".to_string()));

        let database_url = var("ACTIONPACKER_DATABASE_URL").unwrap_or_else(|| {
            format!("sqlite:{}?mode=rwc", data_dir.join("fleet.db").display())
        });

        let reconcile_interval = secs(&var, "ACTIONPACKER_RECONCILE_INTERVAL_SECS", 30)?;
        if reconcile_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                var: "ACTIONPACKER_RECONCILE_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        let runner_sha256 = match var("ACTIONPACKER_RUNNER_SHA256") {
            Some(digest) => {
                let digest = digest.trim().to_ascii_lowercase();
                if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(ConfigError::InvalidValue {
                        var: "ACTIONPACKER_RUNNER_SHA256",
                        value: digest,
                    });
                }
                Some(digest)
            }
            None => None,
        };

        let name_prefix =
            var("ACTIONPACKER_NAME_PREFIX").unwrap_or_else(|| "actionpacker".to_string());
        if !name_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::InvalidValue {
                var: "ACTIONPACKER_NAME_PREFIX",
                value: name_prefix,
            });
        }

        Ok(Self {
            data_dir,
            database_url,
            reconcile_interval,
            stop_grace: secs(&var, "ACTIONPACKER_STOP_GRACE_SECS", 10)?,
            operation_timeout: secs(&var, "ACTIONPACKER_OPERATION_TIMEOUT_SECS", 300)?,
            registration_grace: secs(&var, "ACTIONPACKER_REGISTRATION_GRACE_SECS", 120)?,
            runner_version: var("ACTIONPACKER_RUNNER_VERSION")
                .map(|v| v.trim_start_matches('v').to_string())
                .unwrap_or_else(|| "latest".to_string()),
            download_url: var("ACTIONPACKER_RUNNER_DOWNLOAD_URL")
                .unwrap_or_else(|| DEFAULT_DOWNLOAD_URL.to_string()),
            runner_sha256,
            runner_image: var("ACTIONPACKER_RUNNER_IMAGE")
                .unwrap_or_else(|| DEFAULT_RUNNER_IMAGE.to_string()),
            docker_bin: var("ACTIONPACKER_DOCKER_BIN").unwrap_or_else(|| "docker".to_string()),
            name_prefix,
            github_api_url: var("GITHUB_API_URL")
                .unwrap_or_else(|| "https://api.github.com".to_string()),
            github_url: var("GITHUB_URL").unwrap_or_else(|| "https://github.com".to_string()),
            github_token: var("ACTIONPACKER_GITHUB_TOKEN"),
        })
    }

    /// The token for the `default` credential.
    pub fn require_github_token(&self) -> Result<&str, ConfigError> {
        self.github_token
            .as_deref()
            .ok_or(ConfigError::MissingEnvVar("ACTIONPACKER_GITHUB_TOKEN"))
    }
}

fn secs(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    match var(key) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue { var: key, value }),
        None => Ok(Duration::from_secs(default)),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable has a malformed value.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
