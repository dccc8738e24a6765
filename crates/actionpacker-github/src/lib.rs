// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GitHub access for actionpacker.
//!
//! Two concerns live here, both consumed by the fleet engine through traits:
//!
//! - **Credential resolution**: a [`CredentialRef`] points at stored secret
//!   material (a personal access token or a GitHub App installation). The
//!   [`CredentialResolver`] turns it into a bearer token and an authenticated
//!   [`GitHubClient`].
//! - **Runner registry**: the narrow slice of the GitHub REST API the engine
//!   needs for self-hosted runners (registration/removal tokens, listing
//!   registered runners, de-registration, latest agent version).
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | `create_registration_token` | `POST {scope}/actions/runners/registration-token` |
//! | `create_removal_token` | `POST {scope}/actions/runners/remove-token` |
//! | `list_runners` | `GET {scope}/actions/runners` (paginated) |
//! | `delete_runner` | `DELETE {scope}/actions/runners/{id}` |
//! | `latest_runner_version` | `GET /repos/actions/runner/releases/latest` |
//!
//! `{scope}` is `/repos/{owner}/{repo}` or `/orgs/{org}`, see [`RunnerScope`].
//!
//! [`MockGitHub`] implements the same traits in memory for tests.

pub mod client;
pub mod credentials;
pub mod error;
pub mod mock;
pub mod scope;

mod app_auth;

pub use client::{
    ClientProvider, GitHubClient, GitHubConfig, RemoteRunner, RunnerRegistry, RunnerToken,
};
pub use credentials::{
    CredentialKind, CredentialRef, CredentialResolver, CredentialStore, InMemoryCredentialStore,
    StoredCredential,
};
pub use error::{CredentialError, GitHubError};
pub use mock::MockGitHub;
pub use scope::RunnerScope;
