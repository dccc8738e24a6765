// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container-mode lifecycle against the in-memory container runtime.

mod common;

use actionpacker_fleet::backend::BackendError;
use actionpacker_fleet::config::DEFAULT_RUNNER_IMAGE;
use actionpacker_fleet::record::{RunnerMode, RunnerStatus};
use actionpacker_fleet::{Error, LifecycleStep};
use common::{TestContext, TestOptions};

fn env_value<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn test_create_passes_registration_to_container() {
    let ctx = TestContext::new().await;

    let record = ctx
        .engine
        .create_and_start_runner(ctx.container_request())
        .await
        .expect("create should succeed");

    assert_eq!(record.mode, RunnerMode::Container);
    assert_eq!(record.status, RunnerStatus::Running);
    assert_eq!(record.image.as_deref(), Some(DEFAULT_RUNNER_IMAGE));
    let container_id = record.container_id().expect("running runner has a container");
    assert!(ctx.docker.is_running(container_id));

    let env = ctx.docker.container_env(container_id).unwrap();
    assert_eq!(env_value(&env, "RUNNER_TOKEN"), Some("REG0000"));
    assert_eq!(
        env_value(&env, "RUNNER_URL"),
        Some("https://github.com/acme/widgets")
    );
    assert_eq!(env_value(&env, "RUNNER_NAME"), Some(record.name.as_str()));

    let state = ctx
        .engine
        .get_container_status(record.id)
        .await
        .unwrap()
        .expect("container should exist");
    assert!(state.running);

    let logs = ctx.engine.get_runner_logs(record.id, 10).await.unwrap();
    assert!(logs.contains("Listening for Jobs"));
}

#[tokio::test]
async fn test_killed_registered_container_is_orphaned() {
    let ctx = TestContext::new().await;
    let record = ctx
        .engine
        .create_and_start_runner(ctx.container_request())
        .await
        .unwrap();
    let remote_id = ctx.github.register(&ctx.scope(), &record.name);
    assert!(ctx.docker.kill_externally(record.container_id().unwrap()));

    let synced = ctx.engine.sync_runner_status(record.id).await.unwrap();
    assert_eq!(synced.status, RunnerStatus::Orphaned);
    assert!(synced.handle.is_none());
    assert_eq!(synced.remote_id, Some(remote_id));

    // Removing an orphaned runner de-registers it
    let removed = ctx.engine.remove_runner(record.id).await.unwrap();
    assert_eq!(removed.status, RunnerStatus::Removed);
    assert_eq!(ctx.github.deletions(), 1);
    assert!(!ctx.github.is_registered(&ctx.scope(), &record.name));
}

#[tokio::test]
async fn test_killed_unregistered_container_is_removed() {
    let ctx = TestContext::new().await;
    let record = ctx
        .engine
        .create_and_start_runner(ctx.container_request())
        .await
        .unwrap();
    assert!(ctx.docker.kill_externally(record.container_id().unwrap()));

    let synced = ctx.engine.sync_docker_runner_status(record.id).await.unwrap();
    assert_eq!(synced.status, RunnerStatus::Removed);
    assert!(synced.handle.is_none());
}

#[tokio::test]
async fn test_exited_container_is_stopped() {
    let ctx = TestContext::new().await;
    let record = ctx
        .engine
        .create_and_start_runner(ctx.container_request())
        .await
        .unwrap();
    let container_id = record.container_id().unwrap().to_string();
    assert!(ctx.docker.exit_externally(&container_id, 1));

    let synced = ctx.engine.sync_runner_status(record.id).await.unwrap();
    assert_eq!(synced.status, RunnerStatus::Stopped);
    assert_eq!(synced.container_id(), Some(container_id.as_str()));

    let restarted = ctx.engine.start_runner(record.id).await.unwrap();
    assert_eq!(restarted.status, RunnerStatus::Running);
    assert_eq!(restarted.container_id(), Some(container_id.as_str()));
    assert!(ctx.docker.is_running(&container_id));
}

#[tokio::test]
async fn test_concurrent_start_runs_once() {
    let ctx = TestContext::new().await;
    let record = ctx
        .engine
        .create_and_start_runner(ctx.container_request())
        .await
        .unwrap();
    let stopped = ctx.engine.stop_runner(record.id).await.unwrap();
    assert_eq!(stopped.status, RunnerStatus::Stopped);
    assert!(stopped.container_id().is_some());

    let (a, b) = tokio::join!(
        ctx.engine.start_runner(record.id),
        ctx.engine.start_runner(record.id)
    );
    let results = [a, b];
    let started = results.iter().filter(|r| r.is_ok()).count();
    let already = results
        .iter()
        .filter(|r| matches!(r, Err(Error::AlreadyRunning(_))))
        .count();
    assert_eq!(started, 1);
    assert_eq!(already, 1);

    let statuses = ctx.statuses(record.id).await;
    let starts = statuses
        .iter()
        .filter(|s| **s == RunnerStatus::Starting)
        .count();
    // Once during create, once for the restart
    assert_eq!(starts, 2);
    assert_eq!(ctx.docker.container_count(), 1);
}

#[tokio::test]
async fn test_unavailable_runtime_rejects_container_create() {
    let ctx = TestContext::with_options(TestOptions {
        docker_available: false,
        ..Default::default()
    })
    .await;
    assert!(!ctx.engine.is_docker_available().await);
    assert!(ctx.engine.get_docker_info().await.is_none());

    let err = ctx
        .engine
        .create_and_start_runner(ctx.container_request())
        .await
        .unwrap_err();
    assert!(matches!(
        err.root(),
        Error::Backend(BackendError::ContainerRuntimeUnavailable(_))
    ));
    assert!(ctx.engine.list_runners().await.unwrap().is_empty());

    // Process mode is unaffected
    let record = ctx
        .engine
        .create_and_start_runner(ctx.process_request())
        .await
        .unwrap();
    assert_eq!(record.status, RunnerStatus::Running);
    ctx.engine.remove_runner(record.id).await.unwrap();
}

#[tokio::test]
async fn test_failed_pull_leaves_error_record() {
    let ctx = TestContext::new().await;
    ctx.docker.fail_pull("ghcr.io/acme/broken:1");

    let err = ctx
        .engine
        .create_and_start_runner(ctx.container_request().with_image("ghcr.io/acme/broken:1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Lifecycle {
            step: LifecycleStep::PullImage,
            ..
        }
    ));

    let runners = ctx.engine.list_runners().await.unwrap();
    assert_eq!(runners.len(), 1);
    assert_eq!(runners[0].status, RunnerStatus::Error);
    assert!(runners[0].last_error.as_deref().unwrap().contains("manifest unknown"));
    assert_eq!(ctx.docker.container_count(), 0);
    assert_eq!(ctx.github.registration_tokens_issued(), 0);

    // An error record can still be removed
    let removed = ctx.engine.remove_runner(runners[0].id).await.unwrap();
    assert_eq!(removed.status, RunnerStatus::Removed);
}

#[tokio::test]
async fn test_remove_deletes_container() {
    let ctx = TestContext::new().await;
    let record = ctx
        .engine
        .create_and_start_runner(ctx.container_request().with_name("widgets-ci-1"))
        .await
        .unwrap();
    assert_eq!(record.name, "widgets-ci-1");
    assert_eq!(ctx.docker.container_count(), 1);

    let removed = ctx.engine.remove_runner(record.id).await.unwrap();
    assert_eq!(removed.status, RunnerStatus::Removed);
    assert!(removed.handle.is_none());
    assert_eq!(ctx.docker.container_count(), 0);
    assert_eq!(
        ctx.statuses(record.id).await.last(),
        Some(&RunnerStatus::Removed)
    );

    // Logs of a removed container are empty, not an error
    assert_eq!(ctx.engine.get_container_logs(record.id, 10).await.unwrap(), "");

    // The name stays with the removed record
    let err = ctx
        .engine
        .create_and_start_runner(ctx.container_request().with_name("widgets-ci-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NameInUse { runner_id, .. } if runner_id == record.id));
    assert_eq!(ctx.engine.list_runners().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_distinct_runners_create_concurrently() {
    let ctx = TestContext::new().await;

    let creates = (0..3).map(|_| ctx.engine.create_and_start_runner(ctx.container_request()));
    let records = futures::future::join_all(creates)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("every create should succeed");

    let mut handles = records
        .iter()
        .map(|r| r.container_id().unwrap().to_string())
        .collect::<Vec<_>>();
    handles.sort();
    handles.dedup();
    assert_eq!(handles.len(), 3);
    assert!(records.iter().all(|r| r.status == RunnerStatus::Running));
    assert_eq!(ctx.docker.container_count(), 3);
    assert_eq!(ctx.github.registration_tokens_issued(), 3);
}
