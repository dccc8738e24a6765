// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container backend: runs the agent inside a labelled container.
//!
//! Container mode is only usable while the runtime answers `info`. The
//! capability is probed at startup by [`ContainerBackend::init_docker`] and
//! refreshed on every reconciliation pass; while it is unavailable every
//! container operation fails fast with
//! [`BackendError::ContainerRuntimeUnavailable`] instead of timing out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::docker::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary, DockerInfo, MANAGED_LABEL,
    RUNNER_ID_LABEL,
};
use super::{BackendError, Observation, Result, StopOutcome};
use crate::record::{RunnerId, RunnerRecord, short_id};

/// Container backend configuration.
#[derive(Debug, Clone)]
pub struct ContainerBackendConfig {
    /// Prefix for container names (`<prefix>-<runner id>`)
    pub name_prefix: String,
    /// Graceful stop window before SIGKILL
    pub stop_grace: Duration,
}

impl Default for ContainerBackendConfig {
    fn default() -> Self {
        Self {
            name_prefix: "actionpacker".to_string(),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Whether container mode can be used right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerCapability {
    /// Not probed yet.
    Unknown,
    /// Runtime answered `info`.
    Available(DockerInfo),
    /// No runtime configured or it did not answer.
    Unavailable(String),
}

impl ContainerCapability {
    /// Whether container mode is enabled.
    pub fn is_available(&self) -> bool {
        matches!(self, ContainerCapability::Available(_))
    }
}

/// What the agent container needs to register itself.
#[derive(Clone)]
pub struct AgentRegistration<'a> {
    /// Registration URL (repository or organization page).
    pub url: String,
    /// Registration token.
    pub token: &'a str,
}

/// Supervises runner containers through a [`ContainerRuntime`].
pub struct ContainerBackend {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    config: ContainerBackendConfig,
    capability: RwLock<ContainerCapability>,
}

impl ContainerBackend {
    /// Backend over `runtime`. `None` disables container mode entirely.
    pub fn new(runtime: Option<Arc<dyn ContainerRuntime>>, config: ContainerBackendConfig) -> Self {
        Self {
            runtime,
            config,
            capability: RwLock::new(ContainerCapability::Unknown),
        }
    }

    /// Probe the runtime and cache the result.
    pub async fn init_docker(&self) -> ContainerCapability {
        let capability = match &self.runtime {
            None => ContainerCapability::Unavailable("no container runtime configured".to_string()),
            Some(runtime) => match runtime.info().await {
                Ok(info) => ContainerCapability::Available(info),
                Err(e) => ContainerCapability::Unavailable(e.to_string()),
            },
        };

        let mut current = self.capability.write().await;
        if *current != capability {
            match &capability {
                ContainerCapability::Available(info) => info!(
                    server_version = %info.server_version,
                    architecture = %info.architecture,
                    "Container runtime available, container mode enabled"
                ),
                ContainerCapability::Unavailable(reason) => warn!(
                    reason = %reason,
                    "Container runtime unavailable, container mode disabled"
                ),
                ContainerCapability::Unknown => {}
            }
        }
        *current = capability.clone();
        capability
    }

    /// Whether the last probe succeeded.
    pub async fn is_docker_available(&self) -> bool {
        matches!(
            *self.capability.read().await,
            ContainerCapability::Available(_)
        )
    }

    /// Runtime facts from the last successful probe.
    pub async fn get_docker_info(&self) -> Option<DockerInfo> {
        match &*self.capability.read().await {
            ContainerCapability::Available(info) => Some(info.clone()),
            _ => None,
        }
    }

    /// The runtime, or `ContainerRuntimeUnavailable` if container mode is off.
    pub async fn ensure_available(&self) -> Result<&Arc<dyn ContainerRuntime>> {
        let runtime = self.runtime.as_ref().ok_or_else(|| {
            BackendError::ContainerRuntimeUnavailable("no container runtime configured".to_string())
        })?;

        let unknown = match &*self.capability.read().await {
            ContainerCapability::Available(_) => false,
            ContainerCapability::Unavailable(reason) => {
                return Err(BackendError::ContainerRuntimeUnavailable(reason.clone()));
            }
            ContainerCapability::Unknown => true,
        };
        if unknown
            && let ContainerCapability::Unavailable(reason) = self.init_docker().await
        {
            return Err(BackendError::ContainerRuntimeUnavailable(reason));
        }
        Ok(runtime)
    }

    /// Runtime call failed with `ContainerRuntimeUnavailable`: stop trusting the cache.
    async fn note_failure(&self, err: &BackendError) {
        if let BackendError::ContainerRuntimeUnavailable(reason) = err {
            let mut capability = self.capability.write().await;
            if matches!(*capability, ContainerCapability::Available(_)) {
                warn!(reason = %reason, "Container runtime went away, container mode disabled");
            }
            *capability = ContainerCapability::Unavailable(reason.clone());
        }
    }

    async fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.note_failure(e).await;
        }
        result
    }

    /// Deterministic container name for a runner.
    pub fn container_name(&self, runner_id: RunnerId) -> String {
        format!("{}-{}", self.config.name_prefix, runner_id)
    }

    /// Pull `image` unless it is already present.
    pub async fn pull_runner_image(&self, image: &str) -> Result<()> {
        let runtime = self.ensure_available().await?;
        if self.track(runtime.image_present(image).await).await? {
            debug!(image = %image, "Runner image already present");
            return Ok(());
        }
        info!(image = %image, "Pulling runner image");
        self.track(runtime.pull_image(image).await).await
    }

    /// Create the container for `record`. Returns the container id.
    ///
    /// A leftover container with the same name from an interrupted attempt
    /// is removed first.
    pub async fn create_docker_runner(
        &self,
        record: &RunnerRecord,
        image: &str,
        registration: AgentRegistration<'_>,
    ) -> Result<String> {
        let runtime = self.ensure_available().await?;
        let name = self.container_name(record.id);

        if let Some(stale) = self.track(runtime.inspect_container(&name).await).await? {
            warn!(
                runner_id = %record.id,
                container_id = %short_id(&stale.id),
                "Removing stale container left by an interrupted attempt"
            );
            self.track(runtime.remove_container(&stale.id).await).await?;
        }

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.to_string(),
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (RUNNER_ID_LABEL.to_string(), record.id.to_string()),
            ]),
            env: vec![
                ("RUNNER_NAME".to_string(), record.name.clone()),
                ("RUNNER_URL".to_string(), registration.url),
                ("RUNNER_TOKEN".to_string(), registration.token.to_string()),
                ("RUNNER_LABELS".to_string(), record.labels.join(",")),
                (
                    "RUNNER_SCOPE".to_string(),
                    record.scope.kind_str().to_string(),
                ),
            ],
        };

        let container_id = self.track(runtime.create_container(&spec).await).await?;
        info!(
            runner_id = %record.id,
            container = %name,
            container_id = %short_id(&container_id),
            "Runner container created"
        );
        Ok(container_id)
    }

    /// Start a created container and confirm it is running.
    pub async fn start_docker_runner(&self, container_id: &str) -> Result<()> {
        let runtime = self.ensure_available().await?;
        self.track(runtime.start_container(container_id).await).await?;

        match self.track(runtime.inspect_container(container_id).await).await? {
            Some(state) if state.running => Ok(()),
            Some(state) => {
                let logs = runtime
                    .container_logs(container_id, 20)
                    .await
                    .unwrap_or_default();
                Err(BackendError::Start(format!(
                    "container {} is {} (exit code {:?}): {}",
                    short_id(container_id),
                    state.status,
                    state.exit_code,
                    logs.trim()
                )))
            }
            None => Err(BackendError::Start(format!(
                "container {} disappeared after start",
                short_id(container_id)
            ))),
        }
    }

    /// Stop a container, gracefully first.
    pub async fn stop_docker_runner(&self, container_id: &str) -> Result<StopOutcome> {
        let runtime = self.ensure_available().await?;
        match self.track(runtime.inspect_container(container_id).await).await? {
            Some(state) if state.running => {}
            _ => return Ok(StopOutcome::NotRunning),
        }

        self.track(
            runtime
                .stop_container(container_id, self.config.stop_grace)
                .await,
        )
        .await?;

        let still_running = self
            .track(runtime.inspect_container(container_id).await)
            .await?
            .is_some_and(|state| state.running);
        if still_running {
            warn!(
                container_id = %short_id(container_id),
                "Container survived graceful stop, killing"
            );
            self.track(runtime.kill_container(container_id).await).await?;
            return Ok(StopOutcome::Forced);
        }
        Ok(StopOutcome::Graceful)
    }

    /// Force-remove a container. Missing containers are fine.
    pub async fn remove_docker_runner(&self, container_id: &str) -> Result<()> {
        let runtime = self.ensure_available().await?;
        self.track(runtime.remove_container(container_id).await).await?;
        debug!(container_id = %short_id(container_id), "Runner container removed");
        Ok(())
    }

    /// Inspect a container by id or name.
    pub async fn get_container_status(&self, id_or_name: &str) -> Result<Option<ContainerState>> {
        let runtime = self.ensure_available().await?;
        self.track(runtime.inspect_container(id_or_name).await).await
    }

    /// Current container of `runner_id`, looked up by its deterministic name.
    pub async fn find_runner_container(&self, runner_id: RunnerId) -> Result<Option<ContainerState>> {
        self.get_container_status(&self.container_name(runner_id))
            .await
    }

    /// Map inspected state onto an [`Observation`].
    pub fn map_container_state(state: Option<&ContainerState>) -> Observation {
        match state {
            None => Observation::Missing,
            Some(state) if state.running => Observation::Running,
            Some(_) => Observation::Stopped,
        }
    }

    /// Observe a runner's container by handle, falling back to its name.
    ///
    /// Returns the observation and the container id found, if any.
    pub async fn observe(&self, record: &RunnerRecord) -> Result<(Observation, Option<String>)> {
        let state = match record.container_id() {
            Some(id) => match self.get_container_status(id).await? {
                Some(state) => Some(state),
                None => self.find_runner_container(record.id).await?,
            },
            None => self.find_runner_container(record.id).await?,
        };
        let observation = Self::map_container_state(state.as_ref());
        Ok((observation, state.map(|s| s.id)))
    }

    /// Last `tail` lines of container output.
    pub async fn get_container_logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let runtime = self.ensure_available().await?;
        self.track(runtime.container_logs(container_id, tail).await)
            .await
    }

    /// Every container carrying the fleet's managed label.
    pub async fn list_actionpacker_containers(&self) -> Result<Vec<ContainerSummary>> {
        let runtime = self.ensure_available().await?;
        let filter = format!("{}=true", MANAGED_LABEL);
        self.track(runtime.list_containers(&filter).await).await
    }

    /// Stop and remove a container, for orphans that have no record to update.
    pub async fn destroy_container(&self, container_id: &str) -> Result<StopOutcome> {
        let outcome = self.stop_docker_runner(container_id).await?;
        self.remove_docker_runner(container_id).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockContainerRuntime;
    use crate::record::RunnerMode;
    use actionpacker_github::{CredentialRef, RunnerScope};

    fn backend(runtime: &MockContainerRuntime) -> ContainerBackend {
        ContainerBackend::new(
            Some(Arc::new(runtime.clone())),
            ContainerBackendConfig::default(),
        )
    }

    fn record() -> RunnerRecord {
        RunnerRecord::new(
            RunnerId::new(),
            "actionpacker-c1",
            RunnerMode::Container,
            RunnerScope::organization("acme"),
            CredentialRef::personal_access_token("default", "acme"),
            vec!["self-hosted".to_string(), "linux".to_string()],
            Some("img".to_string()),
        )
    }

    #[tokio::test]
    async fn test_unavailable_runtime_fails_fast() {
        let runtime = MockContainerRuntime::unavailable();
        let backend = backend(&runtime);

        assert!(matches!(
            backend.init_docker().await,
            ContainerCapability::Unavailable(_)
        ));
        assert!(!backend.is_docker_available().await);
        assert!(matches!(
            backend.pull_runner_image("img").await,
            Err(BackendError::ContainerRuntimeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_no_runtime_configured() {
        let backend = ContainerBackend::new(None, ContainerBackendConfig::default());
        assert!(matches!(
            backend.init_docker().await,
            ContainerCapability::Unavailable(_)
        ));
        assert!(backend.get_docker_info().await.is_none());
    }

    #[tokio::test]
    async fn test_create_start_stop_remove() {
        let runtime = MockContainerRuntime::new();
        let backend = backend(&runtime);
        backend.init_docker().await;

        let record = record();
        backend.pull_runner_image("img").await.unwrap();
        backend.pull_runner_image("img").await.unwrap();
        assert_eq!(runtime.pull_count(), 1);

        let id = backend
            .create_docker_runner(
                &record,
                "img",
                AgentRegistration {
                    url: "https://github.com/acme".to_string(),
                    token: "REG0000",
                },
            )
            .await
            .unwrap();
        let env = runtime.container_env(&id).unwrap();
        assert!(env.contains(&("RUNNER_SCOPE".to_string(), "org".to_string())));
        assert!(env.contains(&("RUNNER_LABELS".to_string(), "self-hosted,linux".to_string())));

        backend.start_docker_runner(&id).await.unwrap();
        assert_eq!(backend.observe(&record).await.unwrap().0, Observation::Running);

        assert_eq!(
            backend.stop_docker_runner(&id).await.unwrap(),
            StopOutcome::Graceful
        );
        assert_eq!(
            backend.stop_docker_runner(&id).await.unwrap(),
            StopOutcome::NotRunning
        );
        assert_eq!(backend.observe(&record).await.unwrap().0, Observation::Stopped);

        backend.remove_docker_runner(&id).await.unwrap();
        assert_eq!(backend.observe(&record).await.unwrap().0, Observation::Missing);
    }

    #[tokio::test]
    async fn test_runtime_loss_is_noticed() {
        let runtime = MockContainerRuntime::new();
        let backend = backend(&runtime);
        backend.init_docker().await;
        assert!(backend.is_docker_available().await);

        runtime.set_available(false);
        assert!(backend.list_actionpacker_containers().await.is_err());
        assert!(!backend.is_docker_available().await);
    }
}
