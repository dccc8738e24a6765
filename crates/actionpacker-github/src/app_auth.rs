// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GitHub App authentication: app JWT minting and installation-token exchange.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{CredentialError, GitHubError};

/// GitHub rejects app JWTs valid for more than ten minutes.
const JWT_LIFETIME_SECS: i64 = 540;
/// Backdate `iat` to tolerate clock drift.
const JWT_BACKDATE_SECS: i64 = 60;

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Sign an RS256 JWT identifying the app.
pub(crate) fn app_jwt(
    app_id: u64,
    private_key_pem: &str,
    now: DateTime<Utc>,
) -> Result<String, CredentialError> {
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| CredentialError::Auth(format!("invalid app private key: {}", e)))?;

    let claims = AppClaims {
        iat: (now - Duration::seconds(JWT_BACKDATE_SECS)).timestamp(),
        exp: (now + Duration::seconds(JWT_LIFETIME_SECS)).timestamp(),
        iss: app_id.to_string(),
    };

    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| CredentialError::Auth(format!("failed to sign app JWT: {}", e)))
}

/// Exchange an app JWT for an installation access token.
pub(crate) async fn exchange_installation_token(
    http: &Client,
    api_url: &str,
    installation_id: u64,
    jwt: &str,
) -> Result<InstallationToken, GitHubError> {
    let url = format!(
        "{}/app/installations/{}/access_tokens",
        api_url.trim_end_matches('/'),
        installation_id
    );

    let response = http
        .post(url)
        .header(reqwest::header::ACCEPT, "application/vnd.github+json")
        .header("X-GitHub-Api-Version", "2022-11-28")
        .bearer_auth(jwt)
        .send()
        .await?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::NOT_FOUND {
        return Err(GitHubError::Unauthorized(format!(
            "installation {} rejected the app JWT ({})",
            installation_id, status
        )));
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(GitHubError::Api {
            status: status.as_u16(),
            message,
        });
    }

    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| GitHubError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_pem_is_auth_error() {
        let err = app_jwt(42, "not a key", Utc::now()).unwrap_err();
        assert!(matches!(err, CredentialError::Auth(_)));
    }
}
