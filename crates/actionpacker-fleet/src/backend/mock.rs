// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container runtime for testing.
//!
//! Simulates container state in memory so the container backend, status
//! synchronizer and reconcilers can be exercised without a daemon.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use super::docker::{ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary, DockerInfo};
use super::{BackendError, Result};

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    name: String,
    image: String,
    labels: HashMap<String, String>,
    env: Vec<(String, String)>,
    running: bool,
    started: bool,
    exit_code: Option<i64>,
    logs: Vec<String>,
}

impl MockContainer {
    fn status(&self) -> &'static str {
        match (self.running, self.started) {
            (true, _) => "running",
            (false, true) => "exited",
            (false, false) => "created",
        }
    }
}

/// In-memory [`ContainerRuntime`].
#[derive(Clone, Default)]
pub struct MockContainerRuntime {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    containers: DashMap<String, MockContainer>,
    images: DashSet<String>,
    unavailable: AtomicBool,
    failing_pulls: DashSet<String>,
    next_id: AtomicU64,
    pulls: AtomicU64,
}

impl MockContainerRuntime {
    /// Runtime that is reachable and empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime whose daemon cannot be reached.
    pub fn unavailable() -> Self {
        let runtime = Self::default();
        runtime.set_available(false);
        runtime
    }

    /// Toggle daemon reachability.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make pulls of `image` fail.
    pub fn fail_pull(&self, image: impl Into<String>) {
        self.inner.failing_pulls.insert(image.into());
    }

    /// Number of image pulls performed.
    pub fn pull_count(&self) -> u64 {
        self.inner.pulls.load(Ordering::SeqCst)
    }

    /// Number of containers that exist.
    pub fn container_count(&self) -> usize {
        self.inner.containers.len()
    }

    /// Create a running container directly, as if started outside the fleet.
    pub fn spawn_unmanaged(&self, name: &str, labels: HashMap<String, String>) -> String {
        let id = self.next_container_id();
        self.inner.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: name.to_string(),
                image: "unknown".to_string(),
                labels,
                env: Vec::new(),
                running: true,
                started: true,
                exit_code: None,
                logs: Vec::new(),
            },
        );
        id
    }

    /// Delete a container behind the fleet's back.
    pub fn kill_externally(&self, id_or_name: &str) -> bool {
        match self.resolve(id_or_name) {
            Some(id) => self.inner.containers.remove(&id).is_some(),
            None => false,
        }
    }

    /// Make a running container exit on its own.
    pub fn exit_externally(&self, id_or_name: &str, exit_code: i64) -> bool {
        let Some(id) = self.resolve(id_or_name) else {
            return false;
        };
        match self.inner.containers.get_mut(&id) {
            Some(mut container) => {
                container.running = false;
                container.exit_code = Some(exit_code);
                true
            }
            None => false,
        }
    }

    /// Whether a container with this id or name is running.
    pub fn is_running(&self, id_or_name: &str) -> bool {
        self.resolve(id_or_name)
            .and_then(|id| self.inner.containers.get(&id).map(|c| c.running))
            .unwrap_or(false)
    }

    /// Environment a container was created with.
    pub fn container_env(&self, id_or_name: &str) -> Option<Vec<(String, String)>> {
        let id = self.resolve(id_or_name)?;
        self.inner.containers.get(&id).map(|c| c.env.clone())
    }

    fn next_container_id(&self) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{:064x}", n)
    }

    fn resolve(&self, id_or_name: &str) -> Option<String> {
        if self.inner.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.inner
            .containers
            .iter()
            .find(|entry| entry.name == id_or_name || entry.id.starts_with(id_or_name))
            .map(|entry| entry.id.clone())
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::ContainerRuntimeUnavailable(
                "mock daemon is down".to_string(),
            ));
        }
        Ok(())
    }

    fn no_such_container(id: &str) -> BackendError {
        BackendError::ContainerRuntime(format!("No such container: {}", id))
    }
}

#[async_trait]
impl ContainerRuntime for MockContainerRuntime {
    async fn info(&self) -> Result<DockerInfo> {
        self.check_available()?;
        Ok(DockerInfo {
            server_version: "mock".to_string(),
            operating_system: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            containers: self.inner.containers.len() as u64,
        })
    }

    async fn image_present(&self, image: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.inner.images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.check_available()?;
        self.inner.pulls.fetch_add(1, Ordering::SeqCst);
        if self.inner.failing_pulls.contains(image) {
            return Err(BackendError::ImagePull {
                image: image.to_string(),
                message: "manifest unknown".to_string(),
            });
        }
        self.inner.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.check_available()?;
        if self.inner.containers.iter().any(|c| c.name == spec.name) {
            return Err(BackendError::ContainerRuntime(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        let id = self.next_container_id();
        self.inner.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                labels: spec.labels.clone(),
                env: spec.env.clone(),
                running: false,
                started: false,
                exit_code: None,
                logs: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.check_available()?;
        let mut container = self
            .inner
            .containers
            .get_mut(id)
            .ok_or_else(|| Self::no_such_container(id))?;
        container.running = true;
        container.started = true;
        container.exit_code = None;
        container.logs.push("Listening for Jobs".to_string());
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<()> {
        self.check_available()?;
        if let Some(mut container) = self.inner.containers.get_mut(id)
            && container.running
        {
            container.running = false;
            container.exit_code = Some(0);
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.check_available()?;
        if let Some(mut container) = self.inner.containers.get_mut(id)
            && container.running
        {
            container.running = false;
            container.exit_code = Some(137);
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.check_available()?;
        self.inner.containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<Option<ContainerState>> {
        self.check_available()?;
        let Some(id) = self.resolve(id_or_name) else {
            return Ok(None);
        };
        Ok(self.inner.containers.get(&id).map(|c| ContainerState {
            id: c.id.clone(),
            name: c.name.clone(),
            status: c.status().to_string(),
            running: c.running,
            exit_code: c.exit_code,
            labels: c.labels.clone(),
        }))
    }

    async fn container_logs(&self, id: &str, tail: usize) -> Result<String> {
        self.check_available()?;
        let container = self
            .inner
            .containers
            .get(id)
            .ok_or_else(|| Self::no_such_container(id))?;
        let start = container.logs.len().saturating_sub(tail);
        Ok(container.logs[start..].join("\n"))
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        self.check_available()?;
        let (key, value) = match label.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (label, None),
        };
        Ok(self
            .inner
            .containers
            .iter()
            .filter(|c| match (c.labels.get(key), value) {
                (Some(actual), Some(expected)) => actual == expected,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                state: c.status().to_string(),
                labels: c.labels.clone(),
            })
            .collect())
    }
}
