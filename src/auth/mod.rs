//! OAuth2 token management and SASL assembly
//!
//! Both providers (Google authorization-code, Microsoft device-code)
//! persist the same token triple and expose the same interface to the
//! producer: hand me a non-expired access token, refreshing and
//! persisting as needed. The token file is written with owner-only
//! permissions.

pub mod google;
pub mod microsoft;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Refresh this long before the recorded expiry.
const REFRESH_MARGIN_MINUTES: i64 = 5;

/// A persisted OAuth2 token triple plus granted scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenSet {
    /// Whether the access token is (or is about to be) expired.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        Utc::now() + ChronoDuration::minutes(REFRESH_MARGIN_MINUTES) >= self.expires_at
    }
}

/// Non-secret token metadata for operator tooling.
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub expires_at: DateTime<Utc>,
    pub has_refresh_token: bool,
    pub scopes: Vec<String>,
}

impl From<&TokenSet> for TokenInfo {
    fn from(tokens: &TokenSet) -> Self {
        Self {
            expires_at: tokens.expires_at,
            has_refresh_token: tokens.refresh_token.is_some(),
            scopes: tokens.scopes.clone(),
        }
    }
}

/// JSON token file with owner-only permissions.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted token set, if the file exists.
    pub fn load(&self) -> Result<Option<TokenSet>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let tokens = serde_json::from_str(&raw)?;
        Ok(Some(tokens))
    }

    /// Persist the token set, restricting the file to its owner.
    pub fn save(&self, tokens: &TokenSet) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(tokens)?;
        std::fs::write(&self.path, raw)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Assemble the SASL XOAUTH2 initial response.
#[must_use]
pub fn sasl_xoauth2(username: &str, access_token: &str) -> Vec<u8> {
    format!("user={username}\x01auth=Bearer {access_token}\x01\x01").into_bytes()
}

/// The interface both OAuth2 variants present to the producer.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Run the interactive flow, persist the resulting tokens.
    async fn interactive_setup(&self) -> Result<TokenSet>;

    /// A current, non-expired access token; refreshes preemptively and
    /// persists on refresh.
    async fn access_token(&self) -> Result<String>;

    /// Discard the cached access token and refresh unconditionally.
    /// Used once when the IMAP server rejects an apparently-valid token.
    async fn force_refresh(&self) -> Result<String>;

    /// Revoke the persisted tokens with the provider and delete them.
    async fn revoke(&self) -> Result<()>;

    /// Non-secret token metadata for operator tooling.
    async fn info(&self) -> Result<TokenInfo>;

    /// The SASL XOAUTH2 initial response for `username`.
    async fn sasl_xoauth2(&self, username: &str) -> Result<Vec<u8>> {
        let token = self.access_token().await?;
        Ok(sasl_xoauth2(username, &token))
    }
}

/// Feeds the SASL initial response to async-imap's AUTHENTICATE
/// exchange when the server issues its empty challenge.
pub struct XOAuth2Authenticator {
    response: Vec<u8>,
}

impl XOAuth2Authenticator {
    #[must_use]
    pub fn new(response: Vec<u8>) -> Self {
        Self { response }
    }
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = Vec<u8>;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        self.response.clone()
    }
}
