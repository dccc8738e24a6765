// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-mode lifecycle against a shell-script agent.

#![cfg(unix)]

mod common;

use std::time::Duration;

use actionpacker_fleet::backend::process::{PID_FILE, is_process_alive};
use actionpacker_fleet::record::{RunnerId, RunnerMode, RunnerStatus};
use actionpacker_fleet::{Error, LifecycleStep};
use common::TestContext;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_create_reaches_running() {
    let ctx = TestContext::new().await;

    let record = ctx
        .engine
        .create_and_start_runner(ctx.process_request())
        .await
        .expect("create should succeed");

    assert_eq!(record.mode, RunnerMode::Process);
    assert_eq!(record.status, RunnerStatus::Running);
    assert!(record.name.starts_with("actionpacker-"));
    assert!(record.started_at.is_some());
    let pid = record.pid().expect("running runner has a pid");

    assert_eq!(
        ctx.statuses(record.id).await,
        vec![
            RunnerStatus::Pending,
            RunnerStatus::Configuring,
            RunnerStatus::Starting,
            RunnerStatus::Running,
        ]
    );

    let process = ctx
        .engine
        .get_runner_process(record.id)
        .await
        .unwrap()
        .expect("agent process should be alive");
    assert_eq!(process.pid, pid);
    assert_eq!(ctx.github.registration_tokens_issued(), 1);

    let dir = ctx.engine.process_backend().runner_dir(record.id);
    let configured = std::fs::read_to_string(dir.join(".runner")).unwrap();
    assert!(configured.contains("--url https://github.com/acme/widgets"));
    assert!(configured.contains("--labels self-hosted,linux"));

    ctx.engine.remove_runner(record.id).await.unwrap();
}

#[tokio::test]
async fn test_stop_start_cycle() {
    let ctx = TestContext::new().await;
    let record = ctx
        .engine
        .create_and_start_runner(ctx.process_request())
        .await
        .unwrap();
    let first_pid = record.pid().unwrap();

    let stopped = ctx.engine.stop_runner(record.id).await.unwrap();
    assert_eq!(stopped.status, RunnerStatus::Stopped);
    assert!(stopped.handle.is_none());
    assert!(!is_process_alive(first_pid));
    let events_after_stop = ctx.statuses(record.id).await.len();

    // Stopping again changes nothing
    let again = ctx.engine.stop_runner(record.id).await.unwrap();
    assert_eq!(again.status, RunnerStatus::Stopped);
    assert_eq!(ctx.statuses(record.id).await.len(), events_after_stop);

    let started = ctx.engine.start_runner(record.id).await.unwrap();
    assert_eq!(started.status, RunnerStatus::Running);
    assert!(started.pid().is_some());

    let err = ctx.engine.start_runner(record.id).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning(id) if id == record.id));

    ctx.engine.remove_runner(record.id).await.unwrap();
}

#[tokio::test]
async fn test_remove_deletes_directory() {
    let ctx = TestContext::new().await;
    let record = ctx
        .engine
        .create_and_start_runner(ctx.process_request())
        .await
        .unwrap();
    let pid = record.pid().unwrap();
    let dir = ctx.engine.process_backend().runner_dir(record.id);
    assert!(dir.is_dir());

    let removed = ctx.engine.remove_runner(record.id).await.unwrap();
    assert_eq!(removed.status, RunnerStatus::Removed);
    assert!(removed.handle.is_none());
    assert!(!dir.exists());
    assert!(!is_process_alive(pid));
    assert_eq!(ctx.github.removal_tokens_issued(), 1);

    // Idempotent, and the record is kept
    let again = ctx.engine.remove_runner(record.id).await.unwrap();
    assert_eq!(again.status, RunnerStatus::Removed);
    assert_eq!(ctx.github.removal_tokens_issued(), 1);
    assert_eq!(ctx.engine.list_runners().await.unwrap().len(), 1);

    let err = ctx.engine.stop_runner(record.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[tokio::test]
async fn test_killed_process_syncs_to_stopped() {
    let ctx = TestContext::new().await;
    let record = ctx
        .engine
        .create_and_start_runner(ctx.process_request())
        .await
        .unwrap();
    let pid = record.pid().unwrap();

    killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let synced = ctx.engine.sync_runner_status(record.id).await.unwrap();
    assert_eq!(synced.status, RunnerStatus::Stopped);
    assert!(synced.handle.is_none());
    assert!(synced.last_observed_at.is_some());

    let events = ctx.engine.list_runner_events(record.id).await.unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.from_status, Some(RunnerStatus::Running));
    assert_eq!(last.to_status, RunnerStatus::Stopped);

    // A stopped runner can be brought back
    let started = ctx.engine.start_runner(record.id).await.unwrap();
    assert_eq!(started.status, RunnerStatus::Running);
    ctx.engine.remove_runner(record.id).await.unwrap();
}

#[tokio::test]
async fn test_denied_credential_leaves_error_record() {
    let ctx = TestContext::new().await;
    ctx.github.deny_credential("default");

    let err = ctx
        .engine
        .create_and_start_runner(ctx.process_request())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Lifecycle {
            step: LifecycleStep::ResolveCredential,
            ..
        }
    ));
    assert!(matches!(err.root(), Error::Credential(_)));

    let runners = ctx.engine.list_runners().await.unwrap();
    assert_eq!(runners.len(), 1);
    assert_eq!(runners[0].status, RunnerStatus::Error);
    assert!(runners[0].last_error.is_some());
    assert!(runners[0].handle.is_none());
    assert_eq!(ctx.github.registration_tokens_issued(), 0);
}

#[tokio::test]
async fn test_never_registered_runner_removed_without_credential() {
    let ctx = TestContext::new().await;
    ctx.github.deny_credential("default");

    ctx.engine
        .create_and_start_runner(ctx.process_request())
        .await
        .unwrap_err();
    let id = ctx.engine.list_runners().await.unwrap()[0].id;

    let removed = ctx.engine.remove_runner(id).await.unwrap();
    assert_eq!(removed.status, RunnerStatus::Removed);
    assert!(removed.handle.is_none());
    assert!(!ctx.engine.process_backend().runner_dir(id).exists());
    assert_eq!(ctx.github.removal_tokens_issued(), 0);
    assert_eq!(ctx.github.deletions(), 0);
}

#[tokio::test]
async fn test_registered_runner_without_credential_keeps_local_cleanup() {
    let ctx = TestContext::new().await;
    let record = ctx
        .engine
        .create_and_start_runner(ctx.process_request())
        .await
        .unwrap();
    let pid = record.pid().unwrap();
    let dir = ctx.engine.process_backend().runner_dir(record.id);
    ctx.github.deny_credential("default");

    let err = ctx.engine.remove_runner(record.id).await.unwrap_err();
    match &err {
        Error::DeregistrationIncomplete { runner_id, name, source } => {
            assert_eq!(*runner_id, record.id);
            assert_eq!(name, &record.name);
            assert!(matches!(source.root(), Error::Credential(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Local resources are gone, the possible registration is on record
    assert!(!dir.exists());
    assert!(!is_process_alive(pid));
    let loaded = ctx.engine.get_runner(record.id).await.unwrap();
    assert_eq!(loaded.status, RunnerStatus::Error);
    assert!(loaded.handle.is_none());
    assert!(loaded.last_error.as_deref().unwrap().contains(&record.name));
}

#[tokio::test]
async fn test_cancelled_create_ends_in_error() {
    let ctx = TestContext::new().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = ctx
        .engine
        .create_and_start_runner_with_cancel(ctx.process_request(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), Error::Cancelled));

    let runners = ctx.engine.list_runners().await.unwrap();
    assert_eq!(runners[0].status, RunnerStatus::Error);
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
async fn test_cancel_during_agent_start_leaves_no_process() {
    let ctx = TestContext::new().await;
    let cancel = CancellationToken::new();

    let create = ctx
        .engine
        .create_and_start_runner_with_cancel(ctx.process_request(), cancel.clone());
    // The pid file appears as soon as run.sh is spawned, before it counts as started
    let launched = async {
        loop {
            if let Some(record) = ctx.engine.list_runners().await.unwrap().first()
                && let Some(pid) = ctx.engine.process_backend().read_pid_file(record.id)
            {
                cancel.cancel();
                return (record.id, pid);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    let (result, (id, pid)) = tokio::join!(create, launched);

    let err = result.unwrap_err();
    assert!(matches!(err.root(), Error::Cancelled));
    let loaded = ctx.engine.get_runner(id).await.unwrap();
    assert_eq!(loaded.status, RunnerStatus::Error);
    assert!(loaded.handle.is_none());
    assert!(ctx.engine.process_backend().read_pid_file(id).is_none());

    let mut live = true;
    for _ in 0..50 {
        live = is_live(pid);
        if !live {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!live, "agent {pid} outlived the cancelled create");

    let report = ctx.engine.reconcile_once().await.unwrap();
    assert_eq!(report.orphans.discovered, 0);

    let removed = ctx.engine.remove_runner(id).await.unwrap();
    assert_eq!(removed.status, RunnerStatus::Removed);
    assert!(!ctx.engine.process_backend().runner_dir(id).exists());
}

#[tokio::test]
async fn test_runner_logs_for_process_runner() {
    let ctx = TestContext::new().await;
    let record = ctx
        .engine
        .create_and_start_runner(ctx.process_request())
        .await
        .unwrap();

    // The test agent writes nothing, so the log exists but is empty
    let logs = ctx.engine.get_runner_logs(record.id, 50).await.unwrap();
    assert!(logs.trim().is_empty());

    let err = ctx.engine.get_container_status(record.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    ctx.engine.remove_runner(record.id).await.unwrap();
}

#[tokio::test]
async fn test_foreign_process_is_reaped() {
    let ctx = TestContext::new().await;

    let dir = ctx
        .engine
        .process_backend()
        .runners_dir()
        .join(RunnerId::new().to_string());
    std::fs::create_dir_all(&dir).unwrap();

    let mut child = tokio::process::Command::new("sleep")
        .arg("30")
        .current_dir(&dir)
        .process_group(0)
        .spawn()
        .unwrap();
    let pid = child.id().unwrap();
    std::fs::write(dir.join(PID_FILE), pid.to_string()).unwrap();
    let reaper = tokio::spawn(async move { child.wait().await });

    let report = ctx.engine.reconcile_once().await.unwrap();
    assert_eq!(report.orphans.discovered, 1);
    assert_eq!(report.orphans.stopped, 1);
    assert!(ctx.engine.list_orphans().is_empty());

    reaper.await.unwrap().unwrap();
    assert!(!is_process_alive(pid));
    assert!(!dir.join(PID_FILE).exists());
    assert!(ctx.engine.list_runners().await.unwrap().is_empty());
}
