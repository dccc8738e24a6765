// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registration scope of a self-hosted runner.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GitHubError;

/// The repository or organization a runner is registered against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerScope {
    /// A single repository (`owner/repo`).
    Repository {
        /// Repository owner (user or organization login).
        owner: String,
        /// Repository name.
        repo: String,
    },
    /// A whole organization.
    Organization {
        /// Organization login.
        org: String,
    },
}

impl RunnerScope {
    /// Repository scope.
    pub fn repository(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self::Repository {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Organization scope.
    pub fn organization(org: impl Into<String>) -> Self {
        Self::Organization { org: org.into() }
    }

    /// REST path prefix for the scope's runner endpoints.
    pub fn api_path(&self) -> String {
        match self {
            Self::Repository { owner, repo } => format!("/repos/{}/{}", owner, repo),
            Self::Organization { org } => format!("/orgs/{}", org),
        }
    }

    /// URL handed to the agent's `config.sh --url`.
    pub fn html_url(&self, web_url: &str) -> String {
        format!("{}/{}", web_url.trim_end_matches('/'), self)
    }

    /// Owner login (the organization for org scopes).
    pub fn owner(&self) -> &str {
        match self {
            Self::Repository { owner, .. } => owner,
            Self::Organization { org } => org,
        }
    }

    /// `"repo"` or `"org"`, as injected into runner containers.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Repository { .. } => "repo",
            Self::Organization { .. } => "org",
        }
    }
}

impl fmt::Display for RunnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Repository { owner, repo } => write!(f, "{}/{}", owner, repo),
            Self::Organization { org } => write!(f, "{}", org),
        }
    }
}

impl FromStr for RunnerScope {
    type Err = GitHubError;

    /// Parses `owner/repo` as a repository scope and a bare `org` as an
    /// organization scope.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_matches('/');
        let invalid = || GitHubError::InvalidScope(s.to_string());

        match s.split_once('/') {
            Some((owner, repo)) => {
                if owner.is_empty() || repo.is_empty() || repo.contains('/') {
                    return Err(invalid());
                }
                Ok(Self::repository(owner, repo))
            }
            None if !s.is_empty() => Ok(Self::organization(s)),
            None => Err(invalid()),
        }
    }
}
