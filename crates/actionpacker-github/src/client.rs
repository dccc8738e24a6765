// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GitHub REST client for the self-hosted runner endpoints.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use zeroize::Zeroizing;

use crate::credentials::CredentialRef;
use crate::error::{CredentialError, GitHubError, Result};
use crate::scope::RunnerScope;

const API_VERSION: &str = "2022-11-28";
const PER_PAGE: usize = 100;

/// Endpoints and transport settings for [`GitHubClient`].
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// REST API base, e.g. `https://api.github.com`.
    pub api_url: String,
    /// Web base used to build runner registration URLs, e.g. `https://github.com`.
    pub web_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Value of the `User-Agent` header (GitHub rejects requests without one).
    pub user_agent: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            web_url: "https://github.com".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: concat!("actionpacker/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Short-lived registration or removal token.
#[derive(Clone)]
pub struct RunnerToken {
    token: Zeroizing<String>,
    /// When GitHub stops accepting the token.
    pub expires_at: DateTime<Utc>,
}

impl RunnerToken {
    /// Wrap a token value.
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
            expires_at,
        }
    }

    /// The token value, for handing to the runner agent.
    pub fn secret(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for RunnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A runner as listed by GitHub for a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRunner {
    /// GitHub's runner id.
    pub id: i64,
    /// Registered runner name.
    pub name: String,
    /// `online` or `offline`.
    pub status: String,
    /// Whether the runner is executing a job.
    pub busy: bool,
    /// Label names.
    pub labels: Vec<String>,
}

/// The subset of the GitHub API used to manage self-hosted runners.
#[async_trait]
pub trait RunnerRegistry: Send + Sync {
    /// Issue a registration token for `scope`.
    async fn create_registration_token(&self, scope: &RunnerScope) -> Result<RunnerToken>;

    /// Issue a removal token for `scope`.
    async fn create_removal_token(&self, scope: &RunnerScope) -> Result<RunnerToken>;

    /// All runners currently registered against `scope`.
    async fn list_runners(&self, scope: &RunnerScope) -> Result<Vec<RemoteRunner>>;

    /// De-register a runner. A runner that is already gone counts as success.
    async fn delete_runner(&self, scope: &RunnerScope, runner_id: i64) -> Result<()>;

    /// Latest released agent version, without the leading `v`.
    async fn latest_runner_version(&self) -> Result<String>;

    /// Web base URL used to build the agent's `--url`.
    fn web_url(&self) -> &str;
}

/// Produces an authenticated [`RunnerRegistry`] for a credential reference.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Resolve `credential` and return a client authenticated with it.
    async fn client_for(
        &self,
        credential: &CredentialRef,
    ) -> std::result::Result<Arc<dyn RunnerRegistry>, CredentialError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RunnerList {
    #[serde(default)]
    total_count: usize,
    runners: Vec<RunnerEntry>,
}

#[derive(Deserialize)]
struct RunnerEntry {
    id: i64,
    name: String,
    status: String,
    #[serde(default)]
    busy: bool,
    #[serde(default)]
    labels: Vec<LabelEntry>,
}

#[derive(Deserialize)]
struct LabelEntry {
    name: String,
}

#[derive(Deserialize)]
struct Release {
    tag_name: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Bearer-authenticated GitHub REST client.
#[derive(Clone)]
pub struct GitHubClient {
    config: GitHubConfig,
    http: Client,
    token: Arc<Zeroizing<String>>,
}

impl fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubClient")
            .field("api_url", &self.config.api_url)
            .finish_non_exhaustive()
    }
}

impl GitHubClient {
    /// Build a client authenticated with `token`.
    pub fn new(config: GitHubConfig, token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self::with_http(config, http, token))
    }

    /// Build a client on top of an existing reqwest client (shared connection pool).
    pub fn with_http(config: GitHubConfig, http: Client, token: impl Into<String>) -> Self {
        let mut config = config;
        config.api_url = config.api_url.trim_end_matches('/').to_string();
        Self {
            config,
            http,
            token: Arc::new(Zeroizing::new(token.into())),
        }
    }

    /// API base URL.
    pub fn api_url(&self) -> &str {
        &self.config.api_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.config.api_url, path))
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(self.token.as_str())
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or(body);

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(GitHubError::Unauthorized(message))
            }
            _ => Err(GitHubError::Api {
                status: status.as_u16(),
                message,
            }),
        }
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let response = Self::check(response).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| GitHubError::InvalidResponse(e.to_string()))
    }

    async fn post_token(&self, path: String) -> Result<RunnerToken> {
        let response = self.request(Method::POST, &path).send().await?;
        let body: TokenResponse = Self::json(response).await?;
        Ok(RunnerToken::new(body.token, body.expires_at))
    }
}

#[async_trait]
impl RunnerRegistry for GitHubClient {
    async fn create_registration_token(&self, scope: &RunnerScope) -> Result<RunnerToken> {
        debug!(scope = %scope, "Requesting registration token");
        self.post_token(format!("{}/actions/runners/registration-token", scope.api_path()))
            .await
    }

    async fn create_removal_token(&self, scope: &RunnerScope) -> Result<RunnerToken> {
        debug!(scope = %scope, "Requesting removal token");
        self.post_token(format!("{}/actions/runners/remove-token", scope.api_path()))
            .await
    }

    async fn list_runners(&self, scope: &RunnerScope) -> Result<Vec<RemoteRunner>> {
        let path = format!("{}/actions/runners", scope.api_path());
        let mut runners = Vec::new();
        let mut page = 1usize;

        loop {
            let response = self
                .request(Method::GET, &path)
                .query(&[("per_page", PER_PAGE), ("page", page)])
                .send()
                .await?;
            let list: RunnerList = Self::json(response).await?;
            let fetched = list.runners.len();

            runners.extend(list.runners.into_iter().map(|r| RemoteRunner {
                id: r.id,
                name: r.name,
                status: r.status,
                busy: r.busy,
                labels: r.labels.into_iter().map(|l| l.name).collect(),
            }));

            if fetched < PER_PAGE || runners.len() >= list.total_count {
                break;
            }
            page += 1;
        }

        debug!(scope = %scope, count = runners.len(), "Listed registered runners");
        Ok(runners)
    }

    async fn delete_runner(&self, scope: &RunnerScope, runner_id: i64) -> Result<()> {
        let path = format!("{}/actions/runners/{}", scope.api_path(), runner_id);
        let response = self.request(Method::DELETE, &path).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(scope = %scope, runner_id, "Runner already de-registered");
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn latest_runner_version(&self) -> Result<String> {
        let response = self
            .request(Method::GET, "/repos/actions/runner/releases/latest")
            .send()
            .await?;
        let release: Release = Self::json(response).await?;
        let version = release.tag_name.trim_start_matches('v').to_string();
        if version.is_empty() {
            return Err(GitHubError::InvalidResponse(
                "release has an empty tag_name".to_string(),
            ));
        }
        Ok(version)
    }

    fn web_url(&self) -> &str {
        &self.config.web_url
    }
}
