pub mod webhook;

use anyhow::{bail, Context, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use prdeploy_core::config::GitHubConfig;
use reqwest::header;
use serde::{Deserialize, Serialize};
use time::UtcDateTime;

/// User agent sent on all GitHub REST calls; the API rejects requests
/// without one.
pub const USER_AGENT: &str = concat!("prdeploy/", env!("CARGO_PKG_VERSION"));

pub const ACCEPT_GITHUB_JSON: &str = "application/vnd.github+json";

/// Lifetime of a signed app assertion. GitHub caps assertions at 10 minutes.
const ASSERTION_TTL_SECS: i64 = 600;

/// Bearer credential scoped to one installation. Minted fresh for every
/// webhook delivery, never cached or persisted.
#[derive(Clone)]
pub struct InstallationToken(String);

impl InstallationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for InstallationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InstallationToken(..)")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
}

/// Mints short-lived app identity assertions and exchanges them for
/// installation-scoped access tokens.
pub struct CredentialProvider {
    app_id: u64,
    key: EncodingKey,
    algorithm: Algorithm,
    api_base: String,
    client: reqwest::Client,
}

impl CredentialProvider {
    pub fn new(app_id: u64, key: EncodingKey, algorithm: Algorithm, api_base: String) -> Self {
        Self { app_id, key, algorithm, api_base, client: reqwest::Client::new() }
    }

    /// Load the app's private key from disk. Called once at startup;
    /// a missing or malformed key is a startup failure.
    pub fn from_config(config: &GitHubConfig) -> Result<Self> {
        let pem = std::fs::read(&config.private_key_path).with_context(|| {
            format!("Failed to read private key from {}", config.private_key_path.display())
        })?;
        let key = EncodingKey::from_rsa_pem(&pem).context("Failed to parse RSA private key")?;
        Ok(Self::new(config.app_id, key, Algorithm::RS256, config.api_base.clone()))
    }

    /// Sign a fresh identity assertion: issued now, valid for 10 minutes,
    /// issuer = app id.
    fn mint_assertion(&self) -> Result<String> {
        let iat = UtcDateTime::now().unix_timestamp();
        let claims =
            Claims { iat, exp: iat + ASSERTION_TTL_SECS, iss: self.app_id.to_string() };
        jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.key)
            .context("Failed to sign app assertion")
    }

    /// Exchange a fresh assertion for an installation access token.
    /// Any non-success response aborts the calling flow.
    pub async fn installation_token(&self, installation_id: u64) -> Result<InstallationToken> {
        let assertion = self.mint_assertion()?;
        let url =
            format!("{}/app/installations/{}/access_tokens", self.api_base, installation_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&assertion)
            .header(header::ACCEPT, ACCEPT_GITHUB_JSON)
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .context("Token exchange request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Token exchange for installation {installation_id} failed with {status}: {body}");
        }
        let body: AccessTokenResponse =
            response.json().await.context("Failed to parse access token response")?;
        Ok(InstallationToken(body.token))
    }
}
