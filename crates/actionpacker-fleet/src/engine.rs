// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The fleet engine: caller-driven lifecycle operations and read queries.
//!
//! Every mutating operation takes the runner's lock for its whole duration,
//! reads the record fresh under that lock, and leaves the runner in a
//! settled status (`running`, `stopped`, `removed` or `error`) on every exit
//! path. Reconciliation lives in [`crate::status_sync`],
//! [`crate::orphan_tracker`], [`crate::startup`] and
//! [`crate::reconcile_worker`], all as further `impl FleetEngine` blocks.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use actionpacker_github::{ClientProvider, CredentialRef, RunnerRegistry, RunnerScope};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::container::{AgentRegistration, ContainerBackend};
use crate::backend::docker::{ContainerState, DockerInfo};
use crate::backend::platform::detect_platform;
use crate::backend::process::{AgentConfig, ProcessBackend, RunnerProcess};
use crate::backend::{BackendError, StopOutcome};
use crate::config::DEFAULT_RUNNER_IMAGE;
use crate::error::{Error, LifecycleStep, Result};
use crate::locks::RunnerLocks;
use crate::orphan_tracker::{OrphanRecord, OrphanTracker};
use crate::record::{
    BackendHandle, RunnerEvent, RunnerId, RunnerMode, RunnerRecord, RunnerStatus,
};
use crate::store::RunnerStore;

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix for generated runner names
    pub name_prefix: String,
    /// Image for container runners that do not name one
    pub default_image: String,
    /// Agent version for process runners, or `latest`
    pub runner_version: String,
    /// Upper bound for a single backend step and for lock waits
    pub operation_timeout: Duration,
    /// Time after start before an unlisted running runner counts as lost
    pub registration_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name_prefix: "actionpacker".to_string(),
            default_image: DEFAULT_RUNNER_IMAGE.to_string(),
            runner_version: "latest".to_string(),
            operation_timeout: Duration::from_secs(300),
            registration_grace: Duration::from_secs(120),
        }
    }
}

/// Parameters of [`FleetEngine::create_and_start_runner`].
#[derive(Debug, Clone)]
pub struct CreateRunnerRequest {
    /// Backend. Fixed for the runner's whole life.
    pub mode: RunnerMode,
    /// Repository or organization to register against.
    pub scope: RunnerScope,
    /// Credential used to mint registration and removal tokens.
    pub credential: CredentialRef,
    /// Labels applied at registration.
    pub labels: Vec<String>,
    /// Container image override (container mode only).
    pub image: Option<String>,
    /// Registered name override. Defaults to `<prefix>-<runner id>`.
    pub name: Option<String>,
}

impl CreateRunnerRequest {
    /// Process-mode runner.
    pub fn process(scope: RunnerScope, credential: CredentialRef, labels: Vec<String>) -> Self {
        Self {
            mode: RunnerMode::Process,
            scope,
            credential,
            labels,
            image: None,
            name: None,
        }
    }

    /// Container-mode runner using the default image.
    pub fn container(scope: RunnerScope, credential: CredentialRef, labels: Vec<String>) -> Self {
        Self {
            mode: RunnerMode::Container,
            scope,
            credential,
            labels,
            image: None,
            name: None,
        }
    }

    /// Use `image` instead of the default.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Register under `name`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Lifecycle and reconciliation engine for a fleet of runners.
pub struct FleetEngine {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn RunnerStore>,
    pub(crate) clients: Arc<dyn ClientProvider>,
    pub(crate) process: ProcessBackend,
    pub(crate) containers: ContainerBackend,
    pub(crate) locks: RunnerLocks,
    pub(crate) orphans: OrphanTracker,
    pub(crate) ready: AtomicBool,
    /// Serializes reconciliation passes.
    pub(crate) pass_guard: Mutex<()>,
}

impl FleetEngine {
    /// Assemble an engine. Lifecycle calls fail with `NotReady` until
    /// [`FleetEngine::initialize_runners_on_startup`] has completed.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RunnerStore>,
        clients: Arc<dyn ClientProvider>,
        process: ProcessBackend,
        containers: ContainerBackend,
    ) -> Self {
        Self {
            config,
            store,
            clients,
            process,
            containers,
            locks: RunnerLocks::new(),
            orphans: OrphanTracker::new(),
            ready: AtomicBool::new(false),
            pass_guard: Mutex::new(()),
        }
    }

    /// Whether startup reconciliation has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The process backend.
    pub fn process_backend(&self) -> &ProcessBackend {
        &self.process
    }

    /// The container backend.
    pub fn container_backend(&self) -> &ContainerBackend {
        &self.containers
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Create a runner and bring it to `running`.
    ///
    /// Process mode: detect platform, download, configure, start. Container
    /// mode: pull image, create, start. A failing step leaves the runner in
    /// `error` with its partial artifacts in place; call
    /// [`FleetEngine::remove_runner`] to clean up.
    pub async fn create_and_start_runner(&self, request: CreateRunnerRequest) -> Result<RunnerRecord> {
        self.create_and_start_runner_with_cancel(request, CancellationToken::new())
            .await
    }

    /// [`FleetEngine::create_and_start_runner`] that aborts when `cancel` fires.
    ///
    /// A cancelled runner ends in `error` and is not retried.
    pub async fn create_and_start_runner_with_cancel(
        &self,
        request: CreateRunnerRequest,
        cancel: CancellationToken,
    ) -> Result<RunnerRecord> {
        self.ensure_ready()?;

        // Container mode is off while the runtime is unreachable; no record is created
        if request.mode == RunnerMode::Container {
            self.containers.ensure_available().await?;
        }

        let id = RunnerId::new();
        let name = request
            .name
            .unwrap_or_else(|| format!("{}-{}", self.config.name_prefix, id));
        // Names stay reserved by removed records, so they are never re-registered
        if let Some(existing) = self.store.find_by_name(&name).await? {
            return Err(Error::NameInUse {
                name,
                runner_id: existing.id,
            });
        }
        let image = match request.mode {
            RunnerMode::Process => None,
            RunnerMode::Container => Some(
                request
                    .image
                    .unwrap_or_else(|| self.config.default_image.clone()),
            ),
        };
        let mut record = RunnerRecord::new(
            id,
            name,
            request.mode,
            request.scope,
            request.credential,
            dedup_labels(request.labels),
            image,
        );

        let _guard = self.locks.acquire(id, self.config.operation_timeout).await?;
        self.store.insert(&record).await?;
        self.store
            .record_event(&RunnerEvent::new(id, None, RunnerStatus::Pending, "created"))
            .await?;
        info!(
            runner_id = %id,
            name = %record.name,
            mode = %record.mode,
            scope = %record.scope,
            "Runner created"
        );

        let result = match record.mode {
            RunnerMode::Process => self.provision_process(&mut record, &cancel).await,
            RunnerMode::Container => self.provision_container(&mut record, &cancel).await,
        };

        match result {
            Ok(()) => Ok(record),
            Err(e) => {
                self.fail_runner(&mut record, &e).await;
                Err(e)
            }
        }
    }

    async fn provision_process(
        &self,
        record: &mut RunnerRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = record.id;
        self.transition(record, RunnerStatus::Configuring, "provisioning agent")
            .await?;

        let platform = detect_platform().map_err(|e| Error::lifecycle(id, LifecycleStep::DetectPlatform, e))?;
        let client = self.client_for(record, cancel).await?;

        let version = if self.config.runner_version == "latest" {
            self.run_step(id, LifecycleStep::ResolveVersion, cancel, client.latest_runner_version())
                .await?
        } else {
            self.config.runner_version.clone()
        };

        self.run_step(
            id,
            LifecycleStep::Download,
            cancel,
            self.process.download_runner(id, platform, &version),
        )
        .await?;

        let token = self
            .run_step(
                id,
                LifecycleStep::RegistrationToken,
                cancel,
                client.create_registration_token(&record.scope),
            )
            .await?;

        let url = record.scope.html_url(client.web_url());
        self.run_step(
            id,
            LifecycleStep::Configure,
            cancel,
            self.process.configure_runner(
                id,
                AgentConfig {
                    url: &url,
                    token: token.secret(),
                    name: &record.name,
                    labels: &record.labels,
                },
            ),
        )
        .await?;

        self.transition(record, RunnerStatus::Starting, "launching agent")
            .await?;
        let pid = self
            .run_step(id, LifecycleStep::Start, cancel, self.process.start_runner(id))
            .await?;

        record.handle = Some(BackendHandle::Process { pid });
        record.started_at = Some(Utc::now());
        record.last_error = None;
        self.transition(record, RunnerStatus::Running, "agent process started")
            .await
    }

    async fn provision_container(
        &self,
        record: &mut RunnerRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = record.id;
        self.transition(record, RunnerStatus::Configuring, "provisioning container")
            .await?;

        let image = record
            .image
            .clone()
            .unwrap_or_else(|| self.config.default_image.clone());
        let client = self.client_for(record, cancel).await?;

        self.run_step(
            id,
            LifecycleStep::PullImage,
            cancel,
            self.containers.pull_runner_image(&image),
        )
        .await?;

        let token = self
            .run_step(
                id,
                LifecycleStep::RegistrationToken,
                cancel,
                client.create_registration_token(&record.scope),
            )
            .await?;

        let registration = AgentRegistration {
            url: record.scope.html_url(client.web_url()),
            token: token.secret(),
        };
        let container_id = self
            .run_step(
                id,
                LifecycleStep::CreateContainer,
                cancel,
                self.containers
                    .create_docker_runner(record, &image, registration),
            )
            .await?;

        // Recorded right away so a failed start still points at the container
        record.handle = Some(BackendHandle::Container { container_id: container_id.clone() });
        self.transition(record, RunnerStatus::Starting, "container created")
            .await?;

        self.run_step(
            id,
            LifecycleStep::Start,
            cancel,
            self.containers.start_docker_runner(&container_id),
        )
        .await?;

        record.started_at = Some(Utc::now());
        record.last_error = None;
        self.transition(record, RunnerStatus::Running, "container started")
            .await
    }

    /// Start a `stopped` or `error` runner.
    ///
    /// Fails with `AlreadyRunning` if the runner is running, including when
    /// another caller started it while this call waited for the lock.
    pub async fn start_runner(&self, id: RunnerId) -> Result<RunnerRecord> {
        self.ensure_ready()?;
        let _guard = self.locks.acquire(id, self.config.operation_timeout).await?;
        let mut record = self.load(id).await?;

        match record.status {
            RunnerStatus::Running => return Err(Error::AlreadyRunning(id)),
            RunnerStatus::Stopped | RunnerStatus::Error => {}
            status => {
                return Err(Error::InvalidState {
                    runner_id: id,
                    status,
                    operation: "start",
                });
            }
        }

        let cancel = CancellationToken::new();
        match self.start_locked(&mut record, &cancel).await {
            Ok(()) => Ok(record),
            Err(e @ Error::AlreadyRunning(_)) => Err(e),
            Err(e) => {
                self.fail_runner(&mut record, &e).await;
                Err(e)
            }
        }
    }

    async fn start_locked(&self, record: &mut RunnerRecord, cancel: &CancellationToken) -> Result<()> {
        let id = record.id;
        match record.mode {
            RunnerMode::Process => {
                // Still alive from an earlier start: adopt it instead of double-spawning
                if let Some(process) = self.process.get_runner_process(id, record.pid()) {
                    record.handle = Some(BackendHandle::Process { pid: process.pid });
                    self.transition(record, RunnerStatus::Running, "agent process already alive")
                        .await?;
                    return Err(Error::AlreadyRunning(id));
                }

                self.transition(record, RunnerStatus::Starting, "launching agent")
                    .await?;
                let pid = self
                    .run_step(id, LifecycleStep::Start, cancel, self.process.start_runner(id))
                    .await?;
                record.handle = Some(BackendHandle::Process { pid });
            }
            RunnerMode::Container => {
                let state = self
                    .run_step(id, LifecycleStep::Start, cancel, self.locate_container(record))
                    .await?;
                let Some(state) = state else {
                    return Err(Error::lifecycle(
                        id,
                        LifecycleStep::Start,
                        BackendError::Start("container no longer exists".to_string()),
                    ));
                };
                record.handle = Some(BackendHandle::Container { container_id: state.id.clone() });
                if state.running {
                    self.transition(record, RunnerStatus::Running, "container already running")
                        .await?;
                    return Err(Error::AlreadyRunning(id));
                }

                self.transition(record, RunnerStatus::Starting, "starting container")
                    .await?;
                self.run_step(
                    id,
                    LifecycleStep::Start,
                    cancel,
                    self.containers.start_docker_runner(&state.id),
                )
                .await?;
            }
        }

        record.started_at = Some(Utc::now());
        record.last_error = None;
        self.transition(record, RunnerStatus::Running, "runner started")
            .await
    }

    /// Stop a runner: graceful termination, forced after the grace period.
    ///
    /// Stopping a `stopped` runner is a no-op.
    pub async fn stop_runner(&self, id: RunnerId) -> Result<RunnerRecord> {
        self.ensure_ready()?;
        let _guard = self.locks.acquire(id, self.config.operation_timeout).await?;
        let mut record = self.load(id).await?;

        match record.status {
            RunnerStatus::Stopped => {
                debug!(runner_id = %id, "Runner already stopped");
                return Ok(record);
            }
            RunnerStatus::Removed => {
                return Err(Error::InvalidState {
                    runner_id: id,
                    status: record.status,
                    operation: "stop",
                });
            }
            _ => {}
        }

        match self.stop_locked(&mut record).await {
            Ok(()) => Ok(record),
            Err(e) => {
                self.fail_runner(&mut record, &e).await;
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, record: &mut RunnerRecord) -> Result<()> {
        let id = record.id;
        let cancel = CancellationToken::new();
        self.transition(record, RunnerStatus::Stopping, "stop requested")
            .await?;

        let outcome = match record.mode {
            RunnerMode::Process => {
                let outcome = self
                    .run_step(
                        id,
                        LifecycleStep::Stop,
                        &cancel,
                        self.process.stop_runner(id, record.pid()),
                    )
                    .await?;
                record.handle = None;
                outcome
            }
            RunnerMode::Container => {
                let state = self
                    .run_step(id, LifecycleStep::Stop, &cancel, self.locate_container(record))
                    .await?;
                match state {
                    Some(state) => {
                        let outcome = self
                            .run_step(
                                id,
                                LifecycleStep::Stop,
                                &cancel,
                                self.containers.stop_docker_runner(&state.id),
                            )
                            .await?;
                        record.handle = Some(BackendHandle::Container { container_id: state.id });
                        outcome
                    }
                    None => {
                        record.handle = None;
                        StopOutcome::NotRunning
                    }
                }
            }
        };

        let detail = match outcome {
            StopOutcome::NotRunning => "was not running",
            StopOutcome::Graceful => "stopped gracefully",
            StopOutcome::Forced => "force-terminated after grace period",
        };
        self.transition(record, RunnerStatus::Stopped, detail).await
    }

    /// Stop, de-register and delete a runner's resources, then mark it `removed`.
    ///
    /// Removing a `removed` runner is a no-op. The record itself is kept.
    pub async fn remove_runner(&self, id: RunnerId) -> Result<RunnerRecord> {
        self.ensure_ready()?;
        let result: Result<RunnerRecord> = async {
            let _guard = self.locks.acquire(id, self.config.operation_timeout).await?;
            let mut record = self.load(id).await?;

            if record.status == RunnerStatus::Removed {
                debug!(runner_id = %id, "Runner already removed");
                return Ok(record);
            }

            match self.remove_locked(&mut record).await {
                Ok(()) => Ok(record),
                Err(e) => {
                    self.fail_runner(&mut record, &e).await;
                    Err(e)
                }
            }
        }
        .await;

        if result.is_ok() {
            self.locks.release(id);
        }
        result
    }

    async fn remove_locked(&self, record: &mut RunnerRecord) -> Result<()> {
        let id = record.id;
        let cancel = CancellationToken::new();

        // Container cleanup needs the runtime; find out before touching anything
        if record.mode == RunnerMode::Container {
            self.containers
                .ensure_available()
                .await
                .map_err(|e| Error::lifecycle(id, LifecycleStep::Cleanup, e))?;
        }

        if record.status != RunnerStatus::Stopped {
            self.stop_locked(record).await?;
        }

        // Without a credential, local resources still go; a possible
        // registration is reported once they are gone
        let mut unresolved = None;
        match self.client_for(record, &cancel).await {
            Ok(client) => self.deregister(record, client.as_ref(), &cancel).await?,
            Err(e) if self.may_be_registered(record) => {
                warn!(
                    runner_id = %id,
                    name = %record.name,
                    error = %e,
                    "Cannot de-register runner, deleting local resources anyway"
                );
                unresolved = Some(e);
            }
            Err(e) => {
                info!(
                    runner_id = %id,
                    error = %e,
                    "Runner was never registered, skipping de-registration"
                );
            }
        }

        match record.mode {
            RunnerMode::Process => {
                self.run_step(id, LifecycleStep::Cleanup, &cancel, self.process.remove_runner_dir(id))
                    .await?;
            }
            RunnerMode::Container => {
                let state = self
                    .run_step(id, LifecycleStep::Cleanup, &cancel, self.locate_container(record))
                    .await?;
                if let Some(state) = state {
                    self.run_step(
                        id,
                        LifecycleStep::Cleanup,
                        &cancel,
                        self.containers.remove_docker_runner(&state.id),
                    )
                    .await?;
                }
            }
        }

        record.handle = None;
        if let Some(source) = unresolved {
            return Err(Error::DeregistrationIncomplete {
                runner_id: id,
                name: record.name.clone(),
                source: Box::new(source),
            });
        }
        self.transition(record, RunnerStatus::Removed, "resources deleted")
            .await
    }

    /// Whether GitHub may hold a registration for this runner.
    fn may_be_registered(&self, record: &RunnerRecord) -> bool {
        if record.remote_id.is_some() || record.started_at.is_some() {
            return true;
        }
        match record.mode {
            RunnerMode::Process => self.process.is_configured(record.id),
            RunnerMode::Container => record.handle.is_some(),
        }
    }

    /// De-register from GitHub if still registered.
    ///
    /// Process runners go through `config.sh remove` with a removal token;
    /// when that is not possible, or for containers, the runner is deleted
    /// through the API by its listed id.
    async fn deregister(
        &self,
        record: &RunnerRecord,
        client: &dyn RunnerRegistry,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = record.id;

        if record.mode == RunnerMode::Process && self.process.is_configured(id) {
            let token = self
                .run_step(
                    id,
                    LifecycleStep::RemovalToken,
                    cancel,
                    client.create_removal_token(&record.scope),
                )
                .await?;
            match self
                .run_step(
                    id,
                    LifecycleStep::Deregister,
                    cancel,
                    self.process.deregister_runner(id, token.secret()),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    runner_id = %id,
                    error = %e,
                    "Agent de-registration failed, falling back to the API"
                ),
            }
        }

        let listed = self
            .run_step(
                id,
                LifecycleStep::Deregister,
                cancel,
                client.list_runners(&record.scope),
            )
            .await?;
        let Some(remote) = listed
            .into_iter()
            .find(|r| r.name == record.name || Some(r.id) == record.remote_id)
        else {
            debug!(runner_id = %id, "Runner not registered, nothing to de-register");
            return Ok(());
        };

        self.run_step(
            id,
            LifecycleStep::Deregister,
            cancel,
            client.delete_runner(&record.scope, remote.id),
        )
        .await?;
        info!(runner_id = %id, remote_id = remote.id, "Runner de-registered");
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// A runner record.
    pub async fn get_runner(&self, id: RunnerId) -> Result<RunnerRecord> {
        self.load(id).await
    }

    /// Every runner record, including removed ones.
    pub async fn list_runners(&self) -> Result<Vec<RunnerRecord>> {
        self.store.list().await
    }

    /// Status history of a runner, oldest first.
    pub async fn list_runner_events(&self, id: RunnerId) -> Result<Vec<RunnerEvent>> {
        self.store.list_events(id).await
    }

    /// The live agent process of a process-mode runner.
    pub async fn get_runner_process(&self, id: RunnerId) -> Result<Option<RunnerProcess>> {
        let record = self.load(id).await?;
        self.require_mode(&record, RunnerMode::Process, "get_runner_process")?;
        Ok(self.process.get_runner_process(id, record.pid()))
    }

    /// Runtime state of a container-mode runner's container.
    pub async fn get_container_status(&self, id: RunnerId) -> Result<Option<ContainerState>> {
        let record = self.load(id).await?;
        self.require_mode(&record, RunnerMode::Container, "get_container_status")?;
        Ok(self.locate_container(&record).await?)
    }

    /// Last `tail` lines of a container-mode runner's output.
    pub async fn get_container_logs(&self, id: RunnerId, tail: usize) -> Result<String> {
        let record = self.load(id).await?;
        self.require_mode(&record, RunnerMode::Container, "get_container_logs")?;
        match self.locate_container(&record).await? {
            Some(state) => Ok(self.containers.get_container_logs(&state.id, tail).await?),
            None => Ok(String::new()),
        }
    }

    /// Last `tail` lines of a runner's agent output, for either mode.
    pub async fn get_runner_logs(&self, id: RunnerId, tail: usize) -> Result<String> {
        let record = self.load(id).await?;
        match record.mode {
            RunnerMode::Process => Ok(self.process.runner_logs(id, tail).await?),
            RunnerMode::Container => self.get_container_logs(id, tail).await,
        }
    }

    /// Backend resources currently tracked as orphans.
    pub fn list_orphans(&self) -> Vec<OrphanRecord> {
        self.orphans.list_orphans()
    }

    /// Whether container mode is usable.
    pub async fn is_docker_available(&self) -> bool {
        self.containers.is_docker_available().await
    }

    /// Container runtime facts, when available.
    pub async fn get_docker_info(&self) -> Option<DockerInfo> {
        self.containers.get_docker_info().await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    pub(crate) async fn load(&self, id: RunnerId) -> Result<RunnerRecord> {
        self.store.get(id).await?.ok_or(Error::RunnerNotFound(id))
    }

    fn require_mode(
        &self,
        record: &RunnerRecord,
        mode: RunnerMode,
        operation: &'static str,
    ) -> Result<()> {
        if record.mode == mode {
            Ok(())
        } else {
            Err(Error::InvalidState {
                runner_id: record.id,
                status: record.status,
                operation,
            })
        }
    }

    /// The runner's container by recorded id, falling back to its name.
    pub(crate) async fn locate_container(
        &self,
        record: &RunnerRecord,
    ) -> std::result::Result<Option<ContainerState>, BackendError> {
        if let Some(container_id) = record.container_id()
            && let Some(state) = self.containers.get_container_status(container_id).await?
        {
            return Ok(Some(state));
        }
        self.containers.find_runner_container(record.id).await
    }

    async fn client_for(
        &self,
        record: &RunnerRecord,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn RunnerRegistry>> {
        self.run_step(
            record.id,
            LifecycleStep::ResolveCredential,
            cancel,
            self.clients.client_for(&record.credential),
        )
        .await
    }

    /// Run one bounded, cancellable step, tagging failures with `step`.
    pub(crate) async fn run_step<T, E, F>(
        &self,
        id: RunnerId,
        step: LifecycleStep,
        cancel: &CancellationToken,
        future: F,
    ) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        let timeout = self.config.operation_timeout;
        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(Error::lifecycle(id, step, Error::Cancelled)),

            result = tokio::time::timeout(timeout, future) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Error::lifecycle(id, step, e)),
                Err(_) => Err(Error::lifecycle(
                    id,
                    step,
                    Error::Timeout(format!("{} did not finish within {:?}", step, timeout)),
                )),
            },
        }
    }

    /// Persist a status change and append it to the runner's history.
    pub(crate) async fn transition(
        &self,
        record: &mut RunnerRecord,
        to: RunnerStatus,
        detail: &str,
    ) -> Result<()> {
        let from = record.status;
        record.status = to;
        record.updated_at = Utc::now();
        if let Err(e) = self.store.update(record).await {
            record.status = from;
            return Err(e);
        }
        self.store
            .record_event(&RunnerEvent::new(record.id, Some(from), to, detail))
            .await?;

        info!(
            runner_id = %record.id,
            from = %from,
            to = %to,
            detail = %detail,
            "Runner status changed"
        );
        Ok(())
    }

    /// Settle a runner in `error` after a failed operation.
    pub(crate) async fn fail_runner(&self, record: &mut RunnerRecord, err: &Error) {
        error!(runner_id = %record.id, error = %err, "Runner operation failed");

        // A dead pid is never carried forward
        if let Some(pid) = record.pid()
            && !self.process.is_runner_process_alive(record.id, pid)
        {
            record.handle = None;
        }
        record.last_error = Some(err.to_string());

        if let Err(e) = self
            .transition(record, RunnerStatus::Error, &err.to_string())
            .await
        {
            error!(
                runner_id = %record.id,
                error = %e,
                "Failed to record runner failure"
            );
        }
    }
}

/// Drop empty and duplicate labels, keeping first-seen order.
fn dedup_labels(labels: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    labels
        .into_iter()
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty() && seen.insert(label.clone()))
        .collect()
}
