// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test utilities for actionpacker-fleet integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use actionpacker_fleet::backend::docker::{MANAGED_LABEL, RUNNER_ID_LABEL};
use actionpacker_fleet::backend::mock::MockContainerRuntime;
use actionpacker_fleet::engine::{CreateRunnerRequest, FleetEngine};
use actionpacker_fleet::record::{RunnerId, RunnerStatus};
use actionpacker_fleet::runtime::{FleetRuntime, FleetRuntimeBuilder};
use actionpacker_fleet::store::{RunnerStore, SqliteRunnerStore};
use actionpacker_github::{CredentialRef, MockGitHub, RunnerScope};
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Agent version MockGitHub reports as latest.
pub const AGENT_VERSION: &str = "2.321.0";

const CONFIG_SH: &str = "#!/bin/sh
if [ \"$1\" = \"remove\" ]; then
    rm -f .runner
    exit 0
fi
echo \"$@\" > .runner
";

const RUN_SH: &str = "#!/bin/sh
trap 'exit 0' TERM
while true; do sleep 1; done
";

/// Knobs for [`TestContext::with_options`].
pub struct TestOptions {
    pub docker_available: bool,
    pub registration_grace: Duration,
    pub initialize: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            docker_available: true,
            registration_grace: Duration::from_secs(120),
            initialize: true,
        }
    }
}

/// An engine wired to in-process fakes: in-memory SQLite, MockGitHub,
/// MockContainerRuntime and a wiremock server serving a shell-script agent.
pub struct TestContext {
    pub engine: Arc<FleetEngine>,
    pub store: SqliteRunnerStore,
    pub github: MockGitHub,
    pub docker: MockContainerRuntime,
    pub server: MockServer,
    pub data_dir: TempDir,
    registration_grace: Duration,
}

impl TestContext {
    /// Initialized engine with a reachable container runtime.
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        let store = SqliteRunnerStore::new(pool);
        store.migrate().await.expect("Failed to run migrations");

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/v2\.321\.0/actions-runner-.*-2\.321\.0\.tar\.gz$"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(agent_bundle()))
            .mount(&server)
            .await;

        let docker = if options.docker_available {
            MockContainerRuntime::new()
        } else {
            MockContainerRuntime::unavailable()
        };

        let github = MockGitHub::new();
        let data_dir = TempDir::new().expect("Failed to create temp dir");
        let engine = build_engine(
            &store,
            &github,
            &docker,
            &data_dir,
            &server,
            options.registration_grace,
        );

        let ctx = Self {
            engine,
            store,
            github,
            docker,
            server,
            data_dir,
            registration_grace: options.registration_grace,
        };
        if options.initialize {
            ctx.engine
                .initialize_runners_on_startup()
                .await
                .expect("Startup reconciliation failed");
        }
        ctx
    }

    /// A new engine over the same store, fakes and data directory, as after
    /// a restart. Startup reconciliation has not run.
    pub fn fresh_engine(&self) -> Arc<FleetEngine> {
        build_engine(
            &self.store,
            &self.github,
            &self.docker,
            &self.data_dir,
            &self.server,
            self.registration_grace,
        )
    }

    /// Runtime builder over the same store, fakes and data directory.
    pub fn runtime_builder(&self) -> FleetRuntimeBuilder {
        runtime_builder(
            &self.store,
            &self.github,
            &self.docker,
            &self.data_dir,
            &self.server,
            self.registration_grace,
        )
    }

    /// Replace the engine with a fresh one and run startup reconciliation.
    pub async fn restart(&mut self) -> actionpacker_fleet::StartupReport {
        self.engine = self.fresh_engine();
        self.engine
            .initialize_runners_on_startup()
            .await
            .expect("Startup reconciliation failed")
    }

    pub fn scope(&self) -> RunnerScope {
        RunnerScope::repository("acme", "widgets")
    }

    pub fn credential(&self) -> CredentialRef {
        CredentialRef::personal_access_token("default", "acme")
    }

    pub fn process_request(&self) -> CreateRunnerRequest {
        CreateRunnerRequest::process(
            self.scope(),
            self.credential(),
            vec!["self-hosted".to_string(), "linux".to_string()],
        )
    }

    pub fn container_request(&self) -> CreateRunnerRequest {
        CreateRunnerRequest::container(
            self.scope(),
            self.credential(),
            vec!["self-hosted".to_string(), "docker".to_string()],
        )
    }

    /// Status history of a runner, as `to_status` values.
    pub async fn statuses(&self, id: RunnerId) -> Vec<RunnerStatus> {
        self.store
            .list_events(id)
            .await
            .expect("Failed to list events")
            .into_iter()
            .map(|e| e.to_status)
            .collect()
    }

    /// Start a labelled container no record knows about.
    pub fn spawn_foreign_container(&self) -> String {
        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (RUNNER_ID_LABEL.to_string(), RunnerId::new().to_string()),
        ]);
        self.docker.spawn_unmanaged("actionpacker-leftover", labels)
    }
}

fn build_engine(
    store: &SqliteRunnerStore,
    github: &MockGitHub,
    docker: &MockContainerRuntime,
    data_dir: &TempDir,
    server: &MockServer,
    registration_grace: Duration,
) -> Arc<FleetEngine> {
    let engine = runtime_builder(store, github, docker, data_dir, server, registration_grace)
        .build()
        .expect("Failed to build runtime config")
        .into_engine()
        .expect("Failed to build engine");
    Arc::new(engine)
}

fn runtime_builder(
    store: &SqliteRunnerStore,
    github: &MockGitHub,
    docker: &MockContainerRuntime,
    data_dir: &TempDir,
    server: &MockServer,
    registration_grace: Duration,
) -> FleetRuntimeBuilder {
    FleetRuntime::builder()
        .store(Arc::new(store.clone()))
        .clients(Arc::new(github.clone()))
        .container_runtime(Arc::new(docker.clone()))
        .data_dir(data_dir.path())
        .download_url(server.uri())
        .stop_grace(Duration::from_secs(2))
        .operation_timeout(Duration::from_secs(30))
        .registration_grace(registration_grace)
        .start_probe(Duration::from_millis(200))
}

/// A gzipped tarball holding a shell-script agent.
pub fn agent_bundle() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, body) in [("config.sh", CONFIG_SH), ("run.sh", RUN_SH)] {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, name, body.as_bytes())
            .expect("Failed to append bundle entry");
    }
    let tar = builder.into_inner().expect("Failed to finish tarball");

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&tar).expect("Failed to gzip bundle");
    encoder.finish().expect("Failed to finish gzip")
}
