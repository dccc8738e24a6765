// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime abstraction.
//!
//! [`ContainerRuntime`] is the seam between the container backend and the
//! engine that actually runs containers. [`DockerCli`] drives any
//! docker-compatible CLI (`docker`, `podman`); tests use
//! [`super::mock::MockContainerRuntime`].

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{BackendError, Result};

/// Label marking containers created by this fleet.
pub const MANAGED_LABEL: &str = "io.actionpacker.managed";
/// Label carrying the owning runner id.
pub const RUNNER_ID_LABEL: &str = "io.actionpacker.runner-id";

/// Runtime facts reported by `docker info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerInfo {
    /// Server version.
    pub server_version: String,
    /// Host OS as seen by the daemon.
    pub operating_system: String,
    /// Daemon architecture.
    pub architecture: String,
    /// Containers known to the daemon.
    pub containers: u64,
}

/// Everything needed to create a runner container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Labels applied to the container.
    pub labels: HashMap<String, String>,
    /// Environment. Values may be secret and never appear in argv.
    pub env: Vec<(String, String)>,
}

/// Inspected container state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// Full container id.
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
    /// Runtime status (`created`, `running`, `exited`, ...).
    pub status: String,
    /// Whether the container is running.
    pub running: bool,
    /// Exit code of the last run.
    pub exit_code: Option<i64>,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

/// One line of `docker ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Runtime state (`running`, `exited`, ...).
    pub state: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    /// Runner id label, if present.
    pub fn runner_id_label(&self) -> Option<&str> {
        self.labels.get(RUNNER_ID_LABEL).map(String::as_str)
    }
}

/// Operations the container backend needs from a container engine.
///
/// Removing or stopping a container that does not exist is not an error.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Probe the daemon. Fails with `ContainerRuntimeUnavailable` when unreachable.
    async fn info(&self) -> Result<DockerInfo>;

    /// Whether `image` is present locally.
    async fn image_present(&self, image: &str) -> Result<bool>;

    /// Pull `image`.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a container. Returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created or stopped container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop with SIGTERM, then SIGKILL after `grace`.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;

    /// Send SIGKILL.
    async fn kill_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Inspect a container by id or name. `None` if it does not exist.
    async fn inspect_container(&self, id_or_name: &str) -> Result<Option<ContainerState>>;

    /// Last `tail` lines of combined output.
    async fn container_logs(&self, id: &str, tail: usize) -> Result<String>;

    /// All containers (running or not) carrying `label`.
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>>;
}

/// Docker-compatible CLI runtime.
pub struct DockerCli {
    bin: String,
    timeout: Duration,
}

struct CliOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl DockerCli {
    /// Runtime driving `bin`, bounding every call by `timeout`.
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    async fn exec(&self, args: &[&str]) -> Result<CliOutput> {
        self.exec_with_env(args, &[]).await
    }

    async fn exec_with_env(&self, args: &[&str], env: &[(String, String)]) -> Result<CliOutput> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let command = args.first().copied().unwrap_or_default();
        debug!(bin = %self.bin, command = %command, "Running container runtime command");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::ContainerRuntimeUnavailable(format!(
                    "{} not found",
                    self.bin
                )));
            }
            Ok(Err(e)) => return Err(BackendError::Io(e)),
            Err(_) => {
                return Err(BackendError::Timeout(format!(
                    "{} {} after {:?}",
                    self.bin, command, self.timeout
                )));
            }
        };

        Ok(CliOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn failure(&self, command: &str, output: &CliOutput) -> BackendError {
        BackendError::ContainerRuntime(format!(
            "{} {} failed: {}",
            self.bin,
            command,
            output.stderr.trim()
        ))
    }
}

fn is_no_such_container(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

fn is_daemon_down(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("connection refused")
}

/// `ContainerRuntimeUnavailable` if a failed command could not reach the daemon.
fn daemon_down(output: &CliOutput) -> Option<BackendError> {
    (!output.success && is_daemon_down(&output.stderr)).then(|| {
        BackendError::ContainerRuntimeUnavailable(output.stderr.trim().to_string())
    })
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn info(&self) -> Result<DockerInfo> {
        let output = self.exec(&["info", "--format", "{{json .}}"]).await?;
        if !output.success {
            return Err(BackendError::ContainerRuntimeUnavailable(
                output.stderr.trim().to_string(),
            ));
        }
        parse_info(&output.stdout)
    }

    async fn image_present(&self, image: &str) -> Result<bool> {
        let output = self.exec(&["image", "inspect", "--format", "{{.Id}}", image]).await?;
        if let Some(err) = daemon_down(&output) {
            return Err(err);
        }
        Ok(output.success)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let output = self.exec(&["pull", image]).await?;
        if let Some(err) = daemon_down(&output) {
            return Err(err);
        }
        if !output.success {
            return Err(BackendError::ImagePull {
                image: image.to_string(),
                message: super::tail_lines(output.stderr.trim(), 5),
            });
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let label_args: Vec<String> = spec
            .labels
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let mut args: Vec<&str> = vec!["create", "--name", spec.name.as_str(), "--init"];
        for label in &label_args {
            args.push("--label");
            args.push(label);
        }
        // `-e NAME` takes the value from our own environment
        for (key, _) in &spec.env {
            args.push("-e");
            args.push(key);
        }
        args.push(&spec.image);

        let output = self.exec_with_env(&args, &spec.env).await?;
        if !output.success {
            if is_daemon_down(&output.stderr) {
                return Err(BackendError::ContainerRuntimeUnavailable(
                    output.stderr.trim().to_string(),
                ));
            }
            return Err(self.failure("create", &output));
        }

        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(BackendError::ContainerRuntime(
                "create returned no container id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let output = self.exec(&["start", id]).await?;
        if let Some(err) = daemon_down(&output) {
            return Err(err);
        }
        if !output.success {
            return Err(self.failure("start", &output));
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        let seconds = grace.as_secs().max(1).to_string();
        let output = self.exec(&["stop", "--time", &seconds, id]).await?;
        if !output.success && !is_no_such_container(&output.stderr) {
            return Err(self.failure("stop", &output));
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        let output = self.exec(&["kill", id]).await?;
        if !output.success {
            // Killing a stopped container fails; that is fine
            debug!(container_id = %id, stderr = %output.stderr.trim(), "docker kill returned an error");
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let output = self.exec(&["rm", "--force", id]).await?;
        if !output.success && !is_no_such_container(&output.stderr) {
            return Err(self.failure("rm", &output));
        }
        Ok(())
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<Option<ContainerState>> {
        let output = self
            .exec(&["container", "inspect", "--format", "{{json .}}", id_or_name])
            .await?;
        if !output.success {
            if is_no_such_container(&output.stderr) {
                return Ok(None);
            }
            if is_daemon_down(&output.stderr) {
                return Err(BackendError::ContainerRuntimeUnavailable(
                    output.stderr.trim().to_string(),
                ));
            }
            return Err(self.failure("inspect", &output));
        }
        parse_inspect(&output.stdout).map(Some)
    }

    async fn container_logs(&self, id: &str, tail: usize) -> Result<String> {
        let tail = tail.to_string();
        let output = self.exec(&["logs", "--tail", &tail, id]).await?;
        if !output.success {
            return Err(self.failure("logs", &output));
        }
        // The agent writes to both streams
        let mut logs = output.stdout;
        if !output.stderr.is_empty() {
            if !logs.is_empty() && !logs.ends_with('\n') {
                logs.push('\n');
            }
            logs.push_str(&output.stderr);
        }
        Ok(logs)
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let filter = format!("label={}", label);
        let output = self
            .exec(&[
                "ps",
                "--all",
                "--no-trunc",
                "--filter",
                &filter,
                "--format",
                "{{json .}}",
            ])
            .await?;
        if !output.success {
            if is_daemon_down(&output.stderr) {
                return Err(BackendError::ContainerRuntimeUnavailable(
                    output.stderr.trim().to_string(),
                ));
            }
            return Err(self.failure("ps", &output));
        }
        parse_ps(&output.stdout)
    }
}

fn parse_json(text: &str, what: &str) -> Result<Value> {
    serde_json::from_str(text.trim()).map_err(|e| {
        BackendError::ContainerRuntime(format!("unparseable {} output: {}", what, e))
    })
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_info(stdout: &str) -> Result<DockerInfo> {
    let value = parse_json(stdout, "info")?;
    Ok(DockerInfo {
        server_version: str_field(&value, "ServerVersion"),
        operating_system: str_field(&value, "OperatingSystem"),
        architecture: str_field(&value, "Architecture"),
        containers: value.get("Containers").and_then(Value::as_u64).unwrap_or(0),
    })
}

fn parse_inspect(stdout: &str) -> Result<ContainerState> {
    // `docker inspect` without --format returns an array
    let value = match parse_json(stdout, "inspect")? {
        Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
        other => other,
    };

    let state = value.get("State").cloned().unwrap_or(Value::Null);
    let labels = value
        .get("Config")
        .and_then(|config| config.get("Labels"))
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let id = str_field(&value, "Id");
    if id.is_empty() {
        return Err(BackendError::ContainerRuntime(
            "inspect output has no container id".to_string(),
        ));
    }

    Ok(ContainerState {
        id,
        name: str_field(&value, "Name").trim_start_matches('/').to_string(),
        status: str_field(&state, "Status"),
        running: state.get("Running").and_then(Value::as_bool).unwrap_or(false),
        exit_code: state.get("ExitCode").and_then(Value::as_i64),
        labels,
    })
}

/// `docker ps --format '{{json .}}'` prints labels as `k=v,k=v`.
fn parse_label_list(labels: &str) -> HashMap<String, String> {
    labels
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_ps(stdout: &str) -> Result<Vec<ContainerSummary>> {
    let mut containers = Vec::new();
    for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
        let value = match parse_json(line, "ps") {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Skipping unparseable container listing line");
                continue;
            }
        };
        containers.push(ContainerSummary {
            id: str_field(&value, "ID"),
            name: str_field(&value, "Names"),
            image: str_field(&value, "Image"),
            state: str_field(&value, "State"),
            labels: parse_label_list(&str_field(&value, "Labels")),
        });
    }
    Ok(containers)
}
