// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for actionpacker-fleet.
//!
//! [`FleetRuntime`] wires the record store, GitHub client provider and
//! container runtime into a [`FleetEngine`], runs startup reconciliation and
//! spawns the periodic reconcile worker.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use actionpacker_fleet::backend::docker::DockerCli;
//! use actionpacker_fleet::runtime::FleetRuntime;
//! use actionpacker_fleet::store::SqliteRunnerStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteRunnerStore::connect("sqlite:.data/fleet.db?mode=rwc").await?;
//!     let runtime = FleetRuntime::builder()
//!         .store(Arc::new(store))
//!         .clients(resolver)
//!         .container_runtime(Arc::new(DockerCli::new("docker", Duration::from_secs(300))))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let engine = runtime.engine().clone();
//!     // ... create and manage runners through `engine` ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actionpacker_github::ClientProvider;
use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backend::container::{ContainerBackend, ContainerBackendConfig};
use crate::backend::docker::ContainerRuntime;
use crate::backend::process::{ProcessBackend, ProcessBackendConfig};
use crate::config::{DEFAULT_DOWNLOAD_URL, DEFAULT_RUNNER_IMAGE, FleetConfig};
use crate::engine::{EngineConfig, FleetEngine};
use crate::reconcile_worker::{ReconcileWorker, ReconcileWorkerConfig};
use crate::startup::StartupReport;
use crate::store::RunnerStore;

/// Builder for creating a [`FleetRuntime`].
pub struct FleetRuntimeBuilder {
    store: Option<Arc<dyn RunnerStore>>,
    clients: Option<Arc<dyn ClientProvider>>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    data_dir: PathBuf,
    download_url: String,
    bundle_sha256: Option<String>,
    runner_version: String,
    runner_image: String,
    name_prefix: String,
    reconcile_interval: Duration,
    stop_grace: Duration,
    operation_timeout: Duration,
    registration_grace: Duration,
    start_probe: Duration,
}

impl Default for FleetRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            clients: None,
            container_runtime: None,
            data_dir: PathBuf::from(".data"),
            download_url: DEFAULT_DOWNLOAD_URL.to_string(),
            bundle_sha256: None,
            runner_version: "latest".to_string(),
            runner_image: DEFAULT_RUNNER_IMAGE.to_string(),
            name_prefix: "actionpacker".to_string(),
            reconcile_interval: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(300),
            registration_grace: Duration::from_secs(120),
            start_probe: Duration::from_secs(2),
        }
    }
}

impl FleetRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every setting `config` carries.
    pub fn fleet_config(self, config: &FleetConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            download_url: config.download_url.clone(),
            bundle_sha256: config.runner_sha256.clone(),
            runner_version: config.runner_version.clone(),
            runner_image: config.runner_image.clone(),
            name_prefix: config.name_prefix.clone(),
            reconcile_interval: config.reconcile_interval,
            stop_grace: config.stop_grace,
            operation_timeout: config.operation_timeout,
            registration_grace: config.registration_grace,
            ..self
        }
    }

    /// Set the record store (required).
    pub fn store(mut self, store: Arc<dyn RunnerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the GitHub client provider (required).
    pub fn clients(mut self, clients: Arc<dyn ClientProvider>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Set the container runtime.
    ///
    /// Default: none, container mode disabled.
    pub fn container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    /// Set the data directory for runner working dirs and the bundle cache.
    ///
    /// Default: `.data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set the agent bundle base URL.
    ///
    /// Default: GitHub releases of `actions/runner`
    pub fn download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = url.into();
        self
    }

    /// Require the agent bundle to have this SHA-256 digest.
    ///
    /// Default: not verified
    pub fn bundle_sha256(mut self, digest: impl Into<String>) -> Self {
        self.bundle_sha256 = Some(digest.into());
        self
    }

    /// Set the agent version for process runners.
    ///
    /// Default: `latest`
    pub fn runner_version(mut self, version: impl Into<String>) -> Self {
        self.runner_version = version.into();
        self
    }

    /// Set the default image for container runners.
    ///
    /// Default: `ghcr.io/actions/actions-runner:latest`
    pub fn runner_image(mut self, image: impl Into<String>) -> Self {
        self.runner_image = image.into();
        self
    }

    /// Set the prefix for runner and container names.
    ///
    /// Default: `actionpacker`
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the interval between reconciliation passes.
    ///
    /// Default: 30 seconds
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Set the graceful stop window before forced termination.
    ///
    /// Default: 10 seconds
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set the upper bound for a single backend step and for lock waits.
    ///
    /// Default: 5 minutes
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set how long a started runner may be missing from GitHub's listing.
    ///
    /// Default: 2 minutes
    pub fn registration_grace(mut self, grace: Duration) -> Self {
        self.registration_grace = grace;
        self
    }

    /// Set how long a launched agent process must survive to count as started.
    ///
    /// Default: 2 seconds
    pub fn start_probe(mut self, probe: Duration) -> Self {
        self.start_probe = probe;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<FleetRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let clients = self
            .clients
            .ok_or_else(|| anyhow::anyhow!("clients is required"))?;
        if self.reconcile_interval.is_zero() {
            anyhow::bail!("reconcile_interval must be non-zero");
        }

        Ok(FleetRuntimeConfig {
            store,
            clients,
            container_runtime: self.container_runtime,
            engine: EngineConfig {
                name_prefix: self.name_prefix.clone(),
                default_image: self.runner_image,
                runner_version: self.runner_version,
                operation_timeout: self.operation_timeout,
                registration_grace: self.registration_grace,
            },
            process: ProcessBackendConfig {
                data_dir: self.data_dir,
                download_url: self.download_url,
                bundle_sha256: self.bundle_sha256,
                stop_grace: self.stop_grace,
                start_probe: self.start_probe,
                download_timeout: self.operation_timeout,
            },
            container: ContainerBackendConfig {
                name_prefix: self.name_prefix,
                stop_grace: self.stop_grace,
            },
            worker: ReconcileWorkerConfig {
                poll_interval: self.reconcile_interval,
            },
        })
    }
}

/// Configuration for a [`FleetRuntime`].
pub struct FleetRuntimeConfig {
    store: Arc<dyn RunnerStore>,
    clients: Arc<dyn ClientProvider>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    engine: EngineConfig,
    process: ProcessBackendConfig,
    container: ContainerBackendConfig,
    worker: ReconcileWorkerConfig,
}

impl FleetRuntimeConfig {
    /// Assemble the engine without running startup reconciliation.
    ///
    /// The engine rejects lifecycle calls until
    /// [`FleetEngine::initialize_runners_on_startup`] has run.
    pub fn into_engine(self) -> Result<FleetEngine> {
        let process = ProcessBackend::new(self.process)?;
        let containers = ContainerBackend::new(self.container_runtime, self.container);
        Ok(FleetEngine::new(
            self.engine,
            self.store,
            self.clients,
            process,
            containers,
        ))
    }

    /// Run startup reconciliation, then spawn the reconcile worker.
    pub async fn start(self) -> Result<FleetRuntime> {
        let worker_config = self.worker.clone();
        let engine = Arc::new(self.into_engine()?);

        let startup = engine.initialize_runners_on_startup().await?;

        let worker = ReconcileWorker::new(engine.clone(), worker_config.clone());
        let reconcile_shutdown = worker.shutdown_handle();
        let reconcile_handle = tokio::spawn(async move {
            worker.run().await;
        });

        info!(
            reconcile_interval_secs = worker_config.poll_interval.as_secs(),
            container_mode = engine.is_docker_available().await,
            "FleetRuntime started"
        );

        Ok(FleetRuntime {
            engine,
            startup,
            reconcile_handle,
            reconcile_shutdown,
        })
    }
}

/// A running fleet engine with its background reconcile worker.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination. Runners keep
/// running across shutdown; the next start re-adopts them.
pub struct FleetRuntime {
    engine: Arc<FleetEngine>,
    startup: StartupReport,
    reconcile_handle: JoinHandle<()>,
    reconcile_shutdown: Arc<Notify>,
}

impl FleetRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FleetRuntimeBuilder {
        FleetRuntimeBuilder::new()
    }

    /// The engine, for lifecycle calls and queries.
    pub fn engine(&self) -> &Arc<FleetEngine> {
        &self.engine
    }

    /// What startup reconciliation found.
    pub fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    /// Stop the reconcile worker and wait for it to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("FleetRuntime shutting down...");

        self.reconcile_shutdown.notify_one();

        if let Err(e) = self.reconcile_handle.await {
            error!("Reconcile worker task panicked: {}", e);
        }

        info!("FleetRuntime shutdown complete");
        Ok(())
    }

    /// Check if the background worker is still running.
    pub fn is_running(&self) -> bool {
        !self.reconcile_handle.is_finished()
    }
}
