// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Credential references and their resolution into GitHub clients.
//!
//! The fleet engine never sees secret material. It holds a [`CredentialRef`]
//! per runner and asks the [`CredentialResolver`] (through the
//! [`ClientProvider`] trait) for an authenticated client when it needs to
//! mint or revoke tokens.
//!
//! Secrets are stored at rest by an external collaborator; the
//! [`CredentialStore`] trait receives them already decrypted.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::app_auth;
use crate::client::{ClientProvider, GitHubClient, GitHubConfig, RunnerRegistry};
use crate::error::{CredentialError, GitHubError};

/// Refresh cached installation tokens this long before they expire.
const INSTALLATION_TOKEN_REFRESH_MARGIN_MINS: i64 = 5;

/// What kind of secret a credential reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// A personal access token (classic or fine-grained).
    PersonalAccessToken,
    /// A GitHub App installation.
    Installation,
}

impl CredentialKind {
    /// Stable string form, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::PersonalAccessToken => "personal_access_token",
            CredentialKind::Installation => "installation",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "personal_access_token" => Some(CredentialKind::PersonalAccessToken),
            "installation" => Some(CredentialKind::Installation),
            _ => None,
        }
    }
}

/// Opaque pointer to a stored secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialRef {
    /// Store key of the secret.
    pub id: String,
    /// Kind of secret.
    pub kind: CredentialKind,
    /// Owning user or organization login.
    pub owner: String,
}

impl CredentialRef {
    /// Reference to a personal access token.
    pub fn personal_access_token(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: CredentialKind::PersonalAccessToken,
            owner: owner.into(),
        }
    }

    /// Reference to a GitHub App installation.
    pub fn installation(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: CredentialKind::Installation,
            owner: owner.into(),
        }
    }
}

/// Decrypted secret material.
#[derive(Clone)]
pub enum StoredCredential {
    /// Bearer token used as-is.
    Token {
        /// Token value.
        token: Zeroizing<String>,
        /// Expiry, if the token has one.
        expires_at: Option<DateTime<Utc>>,
    },
    /// GitHub App installation, exchanged for short-lived tokens.
    App {
        /// Numeric app id (JWT issuer).
        app_id: u64,
        /// Installation id.
        installation_id: u64,
        /// PEM-encoded RSA private key of the app.
        private_key_pem: Zeroizing<String>,
    },
}

impl StoredCredential {
    /// A non-expiring token.
    pub fn token(token: impl Into<String>) -> Self {
        Self::Token {
            token: Zeroizing::new(token.into()),
            expires_at: None,
        }
    }

    /// A token with an expiry.
    pub fn expiring_token(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self::Token {
            token: Zeroizing::new(token.into()),
            expires_at: Some(expires_at),
        }
    }

    /// App installation material.
    pub fn app(app_id: u64, installation_id: u64, private_key_pem: impl Into<String>) -> Self {
        Self::App {
            app_id,
            installation_id,
            private_key_pem: Zeroizing::new(private_key_pem.into()),
        }
    }

    fn kind(&self) -> CredentialKind {
        match self {
            StoredCredential::Token { .. } => CredentialKind::PersonalAccessToken,
            StoredCredential::App { .. } => CredentialKind::Installation,
        }
    }
}

impl fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredCredential::Token { expires_at, .. } => f
                .debug_struct("Token")
                .field("expires_at", expires_at)
                .finish_non_exhaustive(),
            StoredCredential::App {
                app_id,
                installation_id,
                ..
            } => f
                .debug_struct("App")
                .field("app_id", app_id)
                .field("installation_id", installation_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Source of decrypted secret material.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the secret stored under `id`.
    async fn load(&self, id: &str) -> Result<Option<StoredCredential>, CredentialError>;
}

/// Credential store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    secrets: DashMap<String, StoredCredential>,
}

impl InMemoryCredentialStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the secret stored under `id`.
    pub fn insert(&self, id: impl Into<String>, credential: StoredCredential) {
        self.secrets.insert(id.into(), credential);
    }

    /// Remove the secret stored under `id`.
    pub fn remove(&self, id: &str) -> bool {
        self.secrets.remove(id).is_some()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self, id: &str) -> Result<Option<StoredCredential>, CredentialError> {
        Ok(self.secrets.get(id).map(|c| c.value().clone()))
    }
}

struct CachedToken {
    token: Zeroizing<String>,
    expires_at: DateTime<Utc>,
}

/// Resolves [`CredentialRef`]s into bearer tokens and authenticated clients.
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    config: GitHubConfig,
    http: Client,
    installation_tokens: DashMap<String, CachedToken>,
}

impl CredentialResolver {
    /// Create a resolver over `store`.
    pub fn new(store: Arc<dyn CredentialStore>, config: GitHubConfig) -> Result<Self, GitHubError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            store,
            config,
            http,
            installation_tokens: DashMap::new(),
        })
    }

    /// Resolve a credential reference into a bearer token.
    ///
    /// Personal access tokens are returned as stored. Installations are
    /// exchanged for an installation token, which is cached until
    /// shortly before it expires.
    pub async fn resolve_credential_token(
        &self,
        credential: &CredentialRef,
    ) -> Result<Zeroizing<String>, CredentialError> {
        let stored = self
            .store
            .load(&credential.id)
            .await?
            .ok_or_else(|| CredentialError::NotFound(credential.id.clone()))?;

        if stored.kind() != credential.kind {
            return Err(CredentialError::Auth(format!(
                "credential {} is stored as {} but referenced as {}",
                credential.id,
                stored.kind().as_str(),
                credential.kind.as_str()
            )));
        }

        match stored {
            StoredCredential::Token { token, expires_at } => {
                if expires_at.is_some_and(|at| at <= Utc::now()) {
                    return Err(CredentialError::Expired(credential.id.clone()));
                }
                Ok(token)
            }
            StoredCredential::App {
                app_id,
                installation_id,
                private_key_pem,
            } => {
                self.installation_token(&credential.id, app_id, installation_id, &private_key_pem)
                    .await
            }
        }
    }

    /// Resolve a credential reference into an authenticated [`GitHubClient`].
    pub async fn create_client_from_credential(
        &self,
        credential: &CredentialRef,
    ) -> Result<GitHubClient, CredentialError> {
        let token = self.resolve_credential_token(credential).await?;
        Ok(GitHubClient::with_http(
            self.config.clone(),
            self.http.clone(),
            token.as_str(),
        ))
    }

    /// Drop any cached installation token for `credential_id`.
    pub fn invalidate(&self, credential_id: &str) {
        self.installation_tokens.remove(credential_id);
    }

    async fn installation_token(
        &self,
        credential_id: &str,
        app_id: u64,
        installation_id: u64,
        private_key_pem: &str,
    ) -> Result<Zeroizing<String>, CredentialError> {
        let now = Utc::now();
        let margin = Duration::minutes(INSTALLATION_TOKEN_REFRESH_MARGIN_MINS);

        if let Some(cached) = self.installation_tokens.get(credential_id)
            && cached.expires_at - margin > now
        {
            return Ok(cached.token.clone());
        }

        let jwt = app_auth::app_jwt(app_id, private_key_pem, now)?;
        let minted = app_auth::exchange_installation_token(
            &self.http,
            &self.config.api_url,
            installation_id,
            &jwt,
        )
        .await
        .map_err(|e| {
            warn!(credential_id, installation_id, error = %e, "Installation token exchange failed");
            CredentialError::Auth(e.to_string())
        })?;

        if minted.expires_at <= now {
            return Err(CredentialError::Expired(credential_id.to_string()));
        }

        info!(
            credential_id,
            installation_id,
            expires_at = %minted.expires_at,
            "Minted installation token"
        );

        let token = Zeroizing::new(minted.token);
        self.installation_tokens.insert(
            credential_id.to_string(),
            CachedToken {
                token: token.clone(),
                expires_at: minted.expires_at,
            },
        );
        Ok(token)
    }
}

#[async_trait]
impl ClientProvider for CredentialResolver {
    async fn client_for(
        &self,
        credential: &CredentialRef,
    ) -> Result<Arc<dyn RunnerRegistry>, CredentialError> {
        debug!(credential_id = %credential.id, kind = credential.kind.as_str(), "Resolving client");
        let client = self.create_client_from_credential(credential).await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(store: InMemoryCredentialStore) -> CredentialResolver {
        CredentialResolver::new(Arc::new(store), GitHubConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_personal_access_token() {
        let store = InMemoryCredentialStore::new();
        store.insert("ci", StoredCredential::token("ghp_abc"));
        let resolver = resolver(store);

        let token = resolver
            .resolve_credential_token(&CredentialRef::personal_access_token("ci", "acme"))
            .await
            .unwrap();
        assert_eq!(token.as_str(), "ghp_abc");
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let resolver = resolver(InMemoryCredentialStore::new());
        let err = resolver
            .resolve_credential_token(&CredentialRef::personal_access_token("nope", "acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::NotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let store = InMemoryCredentialStore::new();
        store.insert(
            "old",
            StoredCredential::expiring_token("ghp_old", Utc::now() - Duration::hours(1)),
        );
        let resolver = resolver(store);

        let err = resolver
            .resolve_credential_token(&CredentialRef::personal_access_token("old", "acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Expired(_)));
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_auth_error() {
        let store = InMemoryCredentialStore::new();
        store.insert("ci", StoredCredential::token("ghp_abc"));
        let resolver = resolver(store);

        let err = resolver
            .resolve_credential_token(&CredentialRef::installation("ci", "acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Auth(_)));
    }

    #[test]
    fn test_stored_credential_debug_hides_secret() {
        let rendered = format!("{:?}", StoredCredential::token("ghp_secret"));
        assert!(!rendered.contains("ghp_secret"));
    }
}
