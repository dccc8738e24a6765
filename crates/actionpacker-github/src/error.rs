// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for actionpacker-github.

use thiserror::Error;

/// Errors from resolving a credential reference into usable auth.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// No secret is stored under the referenced id.
    #[error("Credential not found: {0}")]
    NotFound(String),

    /// The stored secret (or the token minted from it) has expired.
    #[error("Credential expired: {0}")]
    Expired(String),

    /// The secret exists but could not be turned into an authenticated client.
    #[error("Authentication failed: {0}")]
    Auth(String),
}

/// Errors from the GitHub REST API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GitHubError {
    /// Transport-level failure (connect, timeout, TLS, body decoding).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// GitHub answered with a non-success status.
    #[error("GitHub API error {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// `message` field of the error body, or the raw body.
        message: String,
    },

    /// The token was rejected (401/403).
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A success response could not be interpreted.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A scope string could not be parsed.
    #[error("Invalid runner scope: {0:?}")]
    InvalidScope(String),
}

impl GitHubError {
    /// Whether retrying later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GitHubError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GitHubError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Result type for GitHub API calls.
pub type Result<T> = std::result::Result<T, GitHubError>;
