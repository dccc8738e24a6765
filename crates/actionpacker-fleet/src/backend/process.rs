// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process backend: runs the agent as a host process group.
//!
//! Each runner owns `<data_dir>/runners/<runner_id>`. The agent bundle is
//! unpacked there, `config.sh` registers it, and `run.sh` is launched as the
//! leader of its own process group with output appended to `runner.log`.
//! The launched pid is written to `.actionpacker.pid`, which is how orphan
//! scans recognise processes started by this fleet.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::bundle;
use super::platform::Platform;
use super::{BackendError, Observation, Result, StopOutcome, tail_lines};
use crate::record::RunnerId;

/// Pid file written into each working directory.
pub const PID_FILE: &str = ".actionpacker.pid";
/// Agent output log inside each working directory.
pub const LOG_FILE: &str = "runner.log";
/// Written by `config.sh` once the agent is registered.
const AGENT_CONFIG_FILE: &str = ".runner";
/// Environment variable the agent reads its `--token` argument from.
const TOKEN_ENV: &str = "ACTIONS_RUNNER_INPUT_TOKEN";

/// Process backend configuration.
#[derive(Debug, Clone)]
pub struct ProcessBackendConfig {
    /// Root for `runners/` and `cache/`
    pub data_dir: PathBuf,
    /// Agent bundle base URL
    pub download_url: String,
    /// Expected bundle digest
    pub bundle_sha256: Option<String>,
    /// Graceful stop window before SIGKILL
    pub stop_grace: Duration,
    /// How long a freshly launched agent must survive to count as started
    pub start_probe: Duration,
    /// Timeout for bundle downloads
    pub download_timeout: Duration,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".data"),
            download_url: crate::config::DEFAULT_DOWNLOAD_URL.to_string(),
            bundle_sha256: None,
            stop_grace: Duration::from_secs(10),
            start_probe: Duration::from_secs(2),
            download_timeout: Duration::from_secs(300),
        }
    }
}

/// Identity handed to `config.sh`.
pub struct AgentConfig<'a> {
    /// Registration URL (repository or organization page).
    pub url: &'a str,
    /// Short-lived registration token.
    pub token: &'a str,
    /// Name the runner registers under.
    pub name: &'a str,
    /// Labels applied at registration.
    pub labels: &'a [String],
}

/// A live agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerProcess {
    /// Process (and process group) id.
    pub pid: u32,
    /// Working directory the agent runs in.
    pub work_dir: PathBuf,
}

/// A live agent process found by scanning working directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredProcess {
    /// Working directory name. A runner id for directories this fleet created.
    pub dir_name: String,
    /// The process.
    pub process: RunnerProcess,
}

/// Supervises agent processes.
pub struct ProcessBackend {
    config: ProcessBackendConfig,
    http: reqwest::Client,
    children: DashMap<u32, Child>,
}

impl ProcessBackend {
    /// Create a backend rooted at `config.data_dir`.
    pub fn new(config: ProcessBackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .build()
            .map_err(|e| BackendError::Download(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            http,
            children: DashMap::new(),
        })
    }

    /// Parent of all runner working directories.
    pub fn runners_dir(&self) -> PathBuf {
        self.config.data_dir.join("runners")
    }

    /// Working directory of a runner.
    pub fn runner_dir(&self, runner_id: RunnerId) -> PathBuf {
        self.runners_dir().join(runner_id.to_string())
    }

    /// Download and unpack the agent bundle into the runner's working directory.
    ///
    /// A no-op if the directory already holds this platform/version.
    pub async fn download_runner(
        &self,
        runner_id: RunnerId,
        platform: Platform,
        version: &str,
    ) -> Result<PathBuf> {
        let dir = self.runner_dir(runner_id);
        if bundle::is_unpacked(&dir, platform, version) {
            debug!(runner_id = %runner_id, version = %version, "Agent bundle already unpacked");
            return Ok(dir);
        }

        let archive = bundle::ensure_cached(
            &self.http,
            &self.config.download_url,
            &self.config.data_dir.join("cache"),
            platform,
            version,
            self.config.bundle_sha256.as_deref(),
        )
        .await?;
        bundle::unpack(archive, dir.clone(), platform, version.to_string()).await?;

        info!(
            runner_id = %runner_id,
            platform = %platform,
            version = %version,
            dir = %dir.display(),
            "Agent bundle unpacked"
        );
        Ok(dir)
    }

    /// Whether `config.sh` has completed for this runner.
    pub fn is_configured(&self, runner_id: RunnerId) -> bool {
        self.runner_dir(runner_id).join(AGENT_CONFIG_FILE).exists()
    }

    /// Register the agent with `config.sh --unattended`.
    pub async fn configure_runner(&self, runner_id: RunnerId, agent: AgentConfig<'_>) -> Result<()> {
        let dir = self.runner_dir(runner_id);
        if !dir.join("config.sh").exists() {
            return Err(BackendError::Configuration(format!(
                "working directory {} is missing or has no agent",
                dir.display()
            )));
        }

        let labels = agent.labels.join(",");
        let mut args = vec![
            "--unattended",
            "--url",
            agent.url,
            "--name",
            agent.name,
            "--work",
            "_work",
            "--replace",
        ];
        if !labels.is_empty() {
            args.push("--labels");
            args.push(&labels);
        }

        let output = Command::new(dir.join("config.sh"))
            .args(&args)
            .current_dir(&dir)
            .env(TOKEN_ENV, agent.token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(BackendError::Configuration(format!(
                "config.sh exited with {}: {}",
                output.status,
                tail_lines(detail.trim(), 10)
            )));
        }

        info!(runner_id = %runner_id, name = %agent.name, "Agent configured");
        Ok(())
    }

    /// Launch `run.sh` detached and wait out the start probe.
    ///
    /// Returns the pid of the new process group leader.
    pub async fn start_runner(&self, runner_id: RunnerId) -> Result<u32> {
        let dir = self.runner_dir(runner_id);
        if !self.is_configured(runner_id) {
            return Err(BackendError::Configuration(format!(
                "runner {} is not configured",
                runner_id
            )));
        }

        let log_path = dir.join(LOG_FILE);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log.try_clone()?;

        let mut child = Command::new(dir.join("run.sh"))
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .map_err(|e| BackendError::Start(format!("failed to spawn run.sh: {}", e)))?;

        let Some(pid) = child.id() else {
            return Err(BackendError::Start("run.sh exited before its pid was read".to_string()));
        };

        // Until the probe passes, dropping this future kills the agent's group
        let mut launch = Launch {
            pid,
            pid_file: dir.join(PID_FILE),
            state: LaunchState::Probing,
        };
        tokio::fs::write(&launch.pid_file, pid.to_string()).await?;

        // An agent that dies during the probe window never counts as started
        match tokio::time::timeout(self.config.start_probe, child.wait()).await {
            Ok(Ok(status)) => {
                launch.state = LaunchState::Exited;
                let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
                return Err(BackendError::Start(format!(
                    "run.sh exited with {} during startup: {}",
                    status,
                    tail_lines(log.trim(), 10)
                )));
            }
            Ok(Err(e)) => return Err(BackendError::Io(e)),
            Err(_) => {}
        }

        launch.state = LaunchState::Started;
        self.children.insert(pid, child);

        info!(runner_id = %runner_id, pid = pid, "Agent process started");
        Ok(pid)
    }

    /// Pid recorded in the runner's pid file.
    pub fn read_pid_file(&self, runner_id: RunnerId) -> Option<u32> {
        read_pid_file(&self.runner_dir(runner_id))
    }

    /// Whether `pid` is alive and is this runner's agent.
    pub fn is_runner_process_alive(&self, runner_id: RunnerId, pid: u32) -> bool {
        if let Some(alive) = self.owned_child_alive(pid) {
            return alive;
        }
        is_process_alive(pid) && runs_in(pid, &self.runner_dir(runner_id))
    }

    /// Reap an owned child if it exited. `None` if `pid` is not ours.
    fn owned_child_alive(&self, pid: u32) -> Option<bool> {
        let status = {
            let mut child = self.children.get_mut(&pid)?;
            child.try_wait()
        };
        match status {
            Ok(None) => Some(true),
            Ok(Some(status)) => {
                debug!(pid = pid, status = %status, "Agent process exited");
                self.children.remove(&pid);
                Some(false)
            }
            Err(e) => {
                warn!(pid = pid, error = %e, "Failed to poll agent process");
                self.children.remove(&pid);
                Some(is_process_alive(pid))
            }
        }
    }

    /// The runner's live agent process, checking `recorded_pid` first and
    /// then the pid file.
    pub fn get_runner_process(
        &self,
        runner_id: RunnerId,
        recorded_pid: Option<u32>,
    ) -> Option<RunnerProcess> {
        let work_dir = self.runner_dir(runner_id);
        let candidates = recorded_pid
            .into_iter()
            .chain(read_pid_file(&work_dir))
            .collect::<Vec<_>>();

        candidates
            .into_iter()
            .find(|pid| self.is_runner_process_alive(runner_id, *pid))
            .map(|pid| RunnerProcess { pid, work_dir })
    }

    /// Observe a runner's process: running, stopped (working directory
    /// present) or missing. Returns the live pid when running.
    pub fn observe(&self, runner_id: RunnerId, recorded_pid: Option<u32>) -> (Observation, Option<u32>) {
        if let Some(process) = self.get_runner_process(runner_id, recorded_pid) {
            return (Observation::Running, Some(process.pid));
        }
        if self.runner_dir(runner_id).is_dir() {
            (Observation::Stopped, None)
        } else {
            (Observation::Missing, None)
        }
    }

    /// Stop the runner's agent: SIGTERM to the group, SIGKILL after the grace period.
    pub async fn stop_runner(
        &self,
        runner_id: RunnerId,
        recorded_pid: Option<u32>,
    ) -> Result<StopOutcome> {
        let dir = self.runner_dir(runner_id);
        let outcome = match self.get_runner_process(runner_id, recorded_pid) {
            None => StopOutcome::NotRunning,
            Some(process) => {
                let outcome = self
                    .terminate(process.pid, |pid| self.is_runner_process_alive(runner_id, pid))
                    .await?;
                info!(runner_id = %runner_id, pid = process.pid, outcome = ?outcome, "Agent process stopped");
                outcome
            }
        };

        remove_file_if_exists(&dir.join(PID_FILE)).await?;
        Ok(outcome)
    }

    /// Terminate a process group the fleet no longer has a record for.
    pub async fn stop_orphan_process(&self, process: &RunnerProcess) -> Result<StopOutcome> {
        let outcome = self
            .terminate(process.pid, |pid| {
                self.owned_child_alive(pid)
                    .unwrap_or_else(|| is_process_alive(pid) && runs_in(pid, &process.work_dir))
            })
            .await?;
        remove_file_if_exists(&process.work_dir.join(PID_FILE)).await?;
        Ok(outcome)
    }

    async fn terminate(&self, pid: u32, alive: impl Fn(u32) -> bool) -> Result<StopOutcome> {
        if !alive(pid) {
            return Ok(StopOutcome::NotRunning);
        }

        signal_group(pid, Signal::SIGTERM);
        let deadline = Instant::now() + self.config.stop_grace;
        while Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !alive(pid) {
                return Ok(StopOutcome::Graceful);
            }
        }

        warn!(pid = pid, grace = ?self.config.stop_grace, "Agent ignored SIGTERM, sending SIGKILL");
        signal_group(pid, Signal::SIGKILL);

        tokio::time::sleep(Duration::from_millis(200)).await;
        if alive(pid) {
            return Err(BackendError::Timeout(format!(
                "process {} still alive after SIGKILL",
                pid
            )));
        }
        Ok(StopOutcome::Forced)
    }

    /// De-register the agent with `config.sh remove`.
    pub async fn deregister_runner(&self, runner_id: RunnerId, removal_token: &str) -> Result<()> {
        let dir = self.runner_dir(runner_id);
        if !self.is_configured(runner_id) {
            return Err(BackendError::Configuration(format!(
                "runner {} has no agent configuration to remove",
                runner_id
            )));
        }

        let output = Command::new(dir.join("config.sh"))
            .arg("remove")
            .current_dir(&dir)
            .env(TOKEN_ENV, removal_token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(BackendError::Configuration(format!(
                "config.sh remove exited with {}: {}",
                output.status,
                tail_lines(String::from_utf8_lossy(&output.stderr).trim(), 10)
            )));
        }
        info!(runner_id = %runner_id, "Agent de-registered");
        Ok(())
    }

    /// Delete the runner's working directory.
    pub async fn remove_runner_dir(&self, runner_id: RunnerId) -> Result<()> {
        let dir = self.runner_dir(runner_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(runner_id = %runner_id, dir = %dir.display(), "Working directory deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Last `tail` lines of the agent log. Empty if the agent never ran.
    pub async fn runner_logs(&self, runner_id: RunnerId, tail: usize) -> Result<String> {
        match tokio::fs::read_to_string(self.runner_dir(runner_id).join(LOG_FILE)).await {
            Ok(log) => Ok(tail_lines(&log, tail)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every live agent process under `runners/` carrying a pid file.
    pub async fn list_actionpacker_processes(&self) -> Result<Vec<DiscoveredProcess>> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.runners_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let work_dir = entry.path();
            if !work_dir.is_dir() {
                continue;
            }
            let Some(pid) = read_pid_file(&work_dir) else {
                continue;
            };
            let alive = self
                .owned_child_alive(pid)
                .unwrap_or_else(|| is_process_alive(pid) && runs_in(pid, &work_dir));
            if alive {
                found.push(DiscoveredProcess {
                    dir_name: entry.file_name().to_string_lossy().into_owned(),
                    process: RunnerProcess { pid, work_dir },
                });
            }
        }
        Ok(found)
    }
}

/// Pid file and process group of an agent still inside its start probe.
///
/// Dropped while probing, it SIGKILLs the group and removes the pid file.
/// The dropped `Child` is reaped by tokio in the background.
struct Launch {
    pid: u32,
    pid_file: PathBuf,
    state: LaunchState,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LaunchState {
    Probing,
    /// The leader was reaped; its pid is never signalled again.
    Exited,
    Started,
}

impl Drop for Launch {
    fn drop(&mut self) {
        if self.state == LaunchState::Started {
            return;
        }
        if self.state == LaunchState::Probing {
            warn!(pid = self.pid, "Agent launch abandoned, killing process group");
            signal_group(self.pid, Signal::SIGKILL);
        }
        if let Err(e) = std::fs::remove_file(&self.pid_file)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.pid_file.display(), error = %e, "Failed to remove pid file");
        }
    }
}

fn read_pid_file(dir: &Path) -> Option<u32> {
    std::fs::read_to_string(dir.join(PID_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Signal a process group, falling back to the single process.
fn signal_group(pid: u32, sig: Signal) {
    let target = Pid::from_raw(pid as i32);
    match signal::killpg(target, sig) {
        Ok(()) => debug!(pid = pid, signal = ?sig, "Signalled process group"),
        Err(Errno::ESRCH) => match signal::kill(target, sig) {
            Ok(()) => debug!(pid = pid, signal = ?sig, "Signalled process"),
            Err(Errno::ESRCH) => debug!(pid = pid, "Process already dead (ESRCH)"),
            Err(e) => warn!(pid = pid, error = %e, "Failed to signal process"),
        },
        Err(e) => warn!(pid = pid, error = %e, "Failed to signal process group"),
    }
}

/// Whether any process with `pid` exists.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether `pid` runs inside `dir`, so a recycled pid is never mistaken for an agent.
#[cfg(target_os = "linux")]
fn runs_in(pid: u32, dir: &Path) -> bool {
    let Ok(cwd) = std::fs::read_link(format!("/proc/{}/cwd", pid)) else {
        // Not readable (other user): trust the pid file
        return true;
    };
    match dir.canonicalize() {
        Ok(dir) => cwd.starts_with(dir),
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn runs_in(_pid: u32, dir: &Path) -> bool {
    dir.is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(data_dir: &Path) -> ProcessBackend {
        ProcessBackend::new(ProcessBackendConfig {
            data_dir: data_dir.to_path_buf(),
            stop_grace: Duration::from_secs(2),
            start_probe: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap()
    }

    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn prepare_agent(backend: &ProcessBackend, id: RunnerId, run_sh: &str) -> PathBuf {
        let dir = backend.runner_dir(id);
        std::fs::create_dir_all(&dir).unwrap();
        write_script(&dir.join("config.sh"), "#!/bin/sh\necho \"$@\" > .runner\n");
        write_script(&dir.join("run.sh"), run_sh);
        dir
    }

    #[test]
    fn test_own_pid_is_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[tokio::test]
    async fn test_observe_without_directory_is_missing() {
        let temp = tempfile::TempDir::new().unwrap();
        let backend = backend(temp.path());
        let (observation, pid) = backend.observe(RunnerId::new(), Some(999_999));
        assert_eq!(observation, Observation::Missing);
        assert!(pid.is_none());
    }

    #[tokio::test]
    async fn test_configure_requires_agent() {
        let temp = tempfile::TempDir::new().unwrap();
        let backend = backend(temp.path());
        let err = backend
            .configure_runner(
                RunnerId::new(),
                AgentConfig {
                    url: "https://github.com/org/repo",
                    token: "REG",
                    name: "r",
                    labels: &[],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp = tempfile::TempDir::new().unwrap();
        let backend = backend(temp.path());
        let id = RunnerId::new();
        let dir = prepare_agent(
            &backend,
            id,
            "#!/bin/sh\ntrap 'exit 0' TERM\nwhile true; do sleep 1; done\n",
        );

        let labels = vec!["self-hosted".to_string()];
        backend
            .configure_runner(
                id,
                AgentConfig {
                    url: "https://github.com/org/repo",
                    token: "REG",
                    name: "r",
                    labels: &labels,
                },
            )
            .await
            .unwrap();
        let args = std::fs::read_to_string(dir.join(".runner")).unwrap();
        assert!(args.contains("--labels self-hosted"));
        assert!(!args.contains("REG"));

        let pid = backend.start_runner(id).await.unwrap();
        assert_eq!(backend.read_pid_file(id), Some(pid));
        assert_eq!(backend.observe(id, Some(pid)), (Observation::Running, Some(pid)));

        let discovered = backend.list_actionpacker_processes().await.unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].dir_name, id.to_string());

        let outcome = backend.stop_runner(id, Some(pid)).await.unwrap();
        assert_ne!(outcome, StopOutcome::NotRunning);
        assert_eq!(backend.observe(id, Some(pid)).0, Observation::Stopped);
        assert_eq!(
            backend.stop_runner(id, Some(pid)).await.unwrap(),
            StopOutcome::NotRunning
        );
        assert!(backend.read_pid_file(id).is_none());
    }

    #[tokio::test]
    async fn test_agent_exiting_during_probe_fails_start() {
        let temp = tempfile::TempDir::new().unwrap();
        let backend = backend(temp.path());
        let id = RunnerId::new();
        let dir = prepare_agent(&backend, id, "#!/bin/sh\necho 'bad token'\nexit 3\n");
        std::fs::write(dir.join(".runner"), "{}").unwrap();

        let err = backend.start_runner(id).await.unwrap_err();
        match err {
            BackendError::Start(message) => assert!(message.contains("bad token")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(backend.read_pid_file(id).is_none());
    }

    /// Alive and not a zombie.
    #[cfg(target_os = "linux")]
    fn is_live(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| {
                let state = stat.rsplit_once(") ")?.1.chars().next()?;
                Some(state != 'Z')
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_abandoned_start_kills_agent() {
        let temp = tempfile::TempDir::new().unwrap();
        let backend = ProcessBackend::new(ProcessBackendConfig {
            data_dir: temp.path().to_path_buf(),
            start_probe: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap();
        let id = RunnerId::new();
        let dir = prepare_agent(&backend, id, "#!/bin/sh
while true; do sleep 1; done
");
        std::fs::write(dir.join(".runner"), "{}").unwrap();

        let pid_file_written = async {
            loop {
                if let Some(pid) = backend.read_pid_file(id) {
                    return pid;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        let pid = tokio::select! {
            result = backend.start_runner(id) => panic!("start returned before the pid file was seen: {result:?}"),
            pid = pid_file_written => pid,
        };

        assert!(backend.read_pid_file(id).is_none());
        let mut live = true;
        for _ in 0..50 {
            live = is_live(pid);
            if !live {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!live, "agent {pid} survived an abandoned start");
        assert!(backend.list_actionpacker_processes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_runner_logs_tail() {
        let temp = tempfile::TempDir::new().unwrap();
        let backend = backend(temp.path());
        let id = RunnerId::new();
        assert_eq!(backend.runner_logs(id, 5).await.unwrap(), "");

        let dir = backend.runner_dir(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(LOG_FILE), "one\ntwo\nthree\n").unwrap();
        assert_eq!(backend.runner_logs(id, 2).await.unwrap(), "two\nthree");
    }
}
