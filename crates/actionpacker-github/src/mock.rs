// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory GitHub for testing.
//!
//! Implements both [`RunnerRegistry`] and [`ClientProvider`] without any
//! network access. Runners only appear in the listing when a test calls
//! [`MockGitHub::register`], mirroring the real agent registering itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::{DashMap, DashSet};

use crate::client::{ClientProvider, RemoteRunner, RunnerRegistry, RunnerToken};
use crate::credentials::CredentialRef;
use crate::error::{CredentialError, GitHubError, Result};
use crate::scope::RunnerScope;

struct Inner {
    runners: DashMap<RunnerScope, Vec<RemoteRunner>>,
    next_id: AtomicI64,
    registration_tokens: AtomicUsize,
    removal_tokens: AtomicUsize,
    deletions: AtomicUsize,
    listing_unavailable: AtomicBool,
    denied_credentials: DashSet<String>,
    latest_version: String,
    web_url: String,
}

/// In-memory stand-in for the GitHub runner API.
#[derive(Clone)]
pub struct MockGitHub {
    inner: Arc<Inner>,
}

impl Default for MockGitHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGitHub {
    /// Empty registry reporting agent version `2.321.0`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                runners: DashMap::new(),
                next_id: AtomicI64::new(1),
                registration_tokens: AtomicUsize::new(0),
                removal_tokens: AtomicUsize::new(0),
                deletions: AtomicUsize::new(0),
                listing_unavailable: AtomicBool::new(false),
                denied_credentials: DashSet::new(),
                latest_version: "2.321.0".to_string(),
                web_url: "https://github.com".to_string(),
            }),
        }
    }

    /// Register a runner under `scope`, as the agent would after `config.sh`.
    /// Returns the assigned remote id.
    pub fn register(&self, scope: &RunnerScope, name: &str) -> i64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .runners
            .entry(scope.clone())
            .or_default()
            .push(RemoteRunner {
                id,
                name: name.to_string(),
                status: "online".to_string(),
                busy: false,
                labels: vec!["self-hosted".to_string()],
            });
        id
    }

    /// Drop a runner from the listing without going through the API.
    pub fn unregister(&self, scope: &RunnerScope, name: &str) {
        if let Some(mut runners) = self.inner.runners.get_mut(scope) {
            runners.retain(|r| r.name != name);
        }
    }

    /// Whether a runner named `name` is listed under `scope`.
    pub fn is_registered(&self, scope: &RunnerScope, name: &str) -> bool {
        self.inner
            .runners
            .get(scope)
            .is_some_and(|runners| runners.iter().any(|r| r.name == name))
    }

    /// Make `list_runners` fail with a transient 503.
    pub fn set_listing_unavailable(&self, unavailable: bool) {
        self.inner
            .listing_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    /// Make `client_for` reject the credential with `id`.
    pub fn deny_credential(&self, id: &str) {
        self.inner.denied_credentials.insert(id.to_string());
    }

    /// Registration tokens issued so far.
    pub fn registration_tokens_issued(&self) -> usize {
        self.inner.registration_tokens.load(Ordering::SeqCst)
    }

    /// Removal tokens issued so far.
    pub fn removal_tokens_issued(&self) -> usize {
        self.inner.removal_tokens.load(Ordering::SeqCst)
    }

    /// Successful `delete_runner` calls that removed a listed runner.
    pub fn deletions(&self) -> usize {
        self.inner.deletions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunnerRegistry for MockGitHub {
    async fn create_registration_token(&self, _scope: &RunnerScope) -> Result<RunnerToken> {
        let n = self.inner.registration_tokens.fetch_add(1, Ordering::SeqCst);
        Ok(RunnerToken::new(
            format!("REG{:04}", n),
            Utc::now() + Duration::hours(1),
        ))
    }

    async fn create_removal_token(&self, _scope: &RunnerScope) -> Result<RunnerToken> {
        let n = self.inner.removal_tokens.fetch_add(1, Ordering::SeqCst);
        Ok(RunnerToken::new(
            format!("REM{:04}", n),
            Utc::now() + Duration::hours(1),
        ))
    }

    async fn list_runners(&self, scope: &RunnerScope) -> Result<Vec<RemoteRunner>> {
        if self.inner.listing_unavailable.load(Ordering::SeqCst) {
            return Err(GitHubError::Api {
                status: 503,
                message: "Service Unavailable".to_string(),
            });
        }
        Ok(self
            .inner
            .runners
            .get(scope)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn delete_runner(&self, scope: &RunnerScope, runner_id: i64) -> Result<()> {
        if let Some(mut runners) = self.inner.runners.get_mut(scope) {
            let before = runners.len();
            runners.retain(|r| r.id != runner_id);
            if runners.len() < before {
                self.inner.deletions.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn latest_runner_version(&self) -> Result<String> {
        Ok(self.inner.latest_version.clone())
    }

    fn web_url(&self) -> &str {
        &self.inner.web_url
    }
}

#[async_trait]
impl ClientProvider for MockGitHub {
    async fn client_for(
        &self,
        credential: &CredentialRef,
    ) -> std::result::Result<Arc<dyn RunnerRegistry>, CredentialError> {
        if self.inner.denied_credentials.contains(&credential.id) {
            return Err(CredentialError::NotFound(credential.id.clone()));
        }
        Ok(Arc::new(self.clone()))
    }
}
