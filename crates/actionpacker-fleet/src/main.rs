// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ActionPacker Fleet - Runner Lifecycle & Reconciliation Daemon
//!
//! Opens the runner record store, reconciles every persisted runner against
//! the host and GitHub, then keeps the fleet converged until interrupted.
//! Runners keep running across restarts and are re-adopted on the next start.

use std::sync::Arc;
use tracing::{info, warn};

use actionpacker_fleet::backend::docker::DockerCli;
use actionpacker_fleet::config::FleetConfig;
use actionpacker_fleet::runtime::FleetRuntime;
use actionpacker_fleet::store::SqliteRunnerStore;
use actionpacker_github::{CredentialResolver, GitHubConfig, InMemoryCredentialStore, StoredCredential};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "actionpacker_fleet=info,actionpacker_github=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = FleetConfig::from_env()?;

    info!(
        data_dir = %config.data_dir.display(),
        database_url = %config.database_url,
        docker_bin = %config.docker_bin,
        "Starting ActionPacker Fleet"
    );

    let store = SqliteRunnerStore::connect(&config.database_url).await?;
    info!("Record store ready");

    let credentials = InMemoryCredentialStore::new();
    match config.require_github_token() {
        Ok(token) => credentials.insert("default", StoredCredential::token(token)),
        Err(e) => warn!(error = %e, "No default credential; runner operations will fail to authenticate"),
    }

    let resolver = CredentialResolver::new(
        Arc::new(credentials),
        GitHubConfig {
            api_url: config.github_api_url.clone(),
            web_url: config.github_url.clone(),
            ..GitHubConfig::default()
        },
    )?;

    let docker = DockerCli::new(config.docker_bin.clone(), config.operation_timeout);

    let runtime = FleetRuntime::builder()
        .fleet_config(&config)
        .store(Arc::new(store))
        .clients(Arc::new(resolver))
        .container_runtime(Arc::new(docker))
        .build()?
        .start()
        .await?;

    let report = runtime.startup_report();
    info!(
        running = report.running,
        errored = report.errored,
        "Fleet ready"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("ActionPacker Fleet shut down");

    Ok(())
}
