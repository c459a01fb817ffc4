//! Anonymous bearer token exchange.

use std::fmt;

use burrow_common::constants::TOKEN_SCOPE_ACTIONS;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::ImageReference;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

use super::{RegistryClient, describe_failure};

/// Short-lived bearer token issued by the token service.
///
/// Tokens are never refreshed: one token must outlive the whole pull.
#[derive(Clone, Deserialize)]
#[serde(try_from = "TokenResponse")]
pub struct RegistryToken {
    token: String,
    expires_in: Option<u64>,
    issued_at: Option<DateTime<Utc>>,
}

/// Wire shape of the token endpoint's response body.
#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
}

impl TryFrom<TokenResponse> for RegistryToken {
    type Error = String;

    fn try_from(raw: TokenResponse) -> std::result::Result<Self, Self::Error> {
        let token = raw
            .token
            .filter(|t| !t.is_empty())
            .or_else(|| raw.access_token.filter(|t| !t.is_empty()))
            .ok_or("response carries neither `token` nor `access_token`")?;
        Ok(Self {
            token,
            expires_in: raw.expires_in,
            issued_at: raw.issued_at,
        })
    }
}

impl RegistryToken {
    /// Parses a token endpoint response body.
    ///
    /// # Errors
    ///
    /// Returns a message if the body is not JSON of the expected shape.
    pub fn from_json(body: &[u8]) -> std::result::Result<Self, String> {
        serde_json::from_slice(body).map_err(|e| e.to_string())
    }

    /// Credential presented in the `Authorization: Bearer` header.
    #[must_use]
    pub fn bearer(&self) -> &str {
        &self.token
    }

    /// Time the token was issued, when reported.
    #[must_use]
    pub const fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at
    }

    /// Instant after which the registry may reject the token.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = TimeDelta::try_seconds(i64::try_from(self.expires_in?).ok()?)?;
        self.issued_at?.checked_add_signed(ttl)
    }

    /// Whether the token is known to be expired at `now`.
    ///
    /// Tokens without issue time or lifetime are assumed valid.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Logs a warning when the token has outlived its lifetime.
    pub(crate) fn warn_if_expired(&self, image: &ImageReference) {
        if self.is_expired_at(Utc::now()) {
            tracing::warn!(image = %image, "registry token expired before the pull finished");
        }
    }
}

impl fmt::Debug for RegistryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryToken")
            .field("token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

impl RegistryClient {
    /// Exchanges the image's repository for an anonymous bearer token scoped
    /// to `pull,push`.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Auth`] if the request fails, the status is not
    /// a success, the body cannot be read, or the body is not a token
    /// document.
    pub fn authenticate(&self, image: &ImageReference) -> Result<RegistryToken> {
        let scope = format!("repository:{}:{TOKEN_SCOPE_ACTIONS}", image.repository());
        tracing::debug!(url = %self.auth_url, scope = %scope, "requesting registry token");

        let auth_err = |message: String| BurrowError::Auth {
            image: image.repository().to_string(),
            message,
        };

        let response = self
            .http
            .get(&self.auth_url)
            .query(&[("service", self.auth_service.as_str()), ("scope", scope.as_str())])
            .send()
            .map_err(|e| auth_err(format!("token request failed: {e}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .map_err(|e| auth_err(format!("failed to read token response: {e}")))?;

        if !status.is_success() {
            return Err(auth_err(describe_failure(status, &body)));
        }

        let token = RegistryToken::from_json(&body)
            .map_err(|e| auth_err(format!("invalid token response: {e}")))?;
        tracing::info!(image = %image, expires_at = ?token.expires_at(), "registry token issued");
        Ok(token)
    }
}
