//! Microsoft OAuth2 (device-code flow, public client)
//!
//! Setup prints a verification URL and user code; the flow polls the
//! token endpoint until the operator finishes in a browser. After that
//! the stored refresh token keeps the producer running headless.

use super::{AuthProvider, TokenFile, TokenInfo, TokenSet};
use crate::config::AuthConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponseType};
use oauth2::devicecode::StandardDeviceAuthorizationResponse;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthType, AuthUrl, ClientId, DeviceAuthorizationUrl, RefreshToken, RequestTokenError, Scope,
    TokenResponse, TokenUrl,
};
use tracing::info;

const IMAP_SCOPE: &str = "https://outlook.office.com/IMAP.AccessAsUser.All";
const OFFLINE_SCOPE: &str = "offline_access";

/// Microsoft OAuth2 provider (device code).
pub struct MicrosoftAuth {
    client_id: String,
    tenant: String,
    token_file: TokenFile,
    cache: tokio::sync::Mutex<Option<TokenSet>>,
}

impl MicrosoftAuth {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let client_id = config
            .microsoft_client_id
            .clone()
            .ok_or_else(|| Error::Config("MS_CLIENT_ID not set".into()))?;
        Ok(Self {
            client_id,
            tenant: config.microsoft_tenant.clone(),
            token_file: TokenFile::new(config.token_file.clone()),
            cache: tokio::sync::Mutex::new(None),
        })
    }

    fn oauth_client(&self) -> Result<BasicClient> {
        let base = format!("https://login.microsoftonline.com/{}/oauth2/v2.0", self.tenant);
        let auth_url = AuthUrl::new(format!("{base}/authorize"))
            .map_err(|e| Error::Config(format!("bad auth url: {e}")))?;
        let token_url = TokenUrl::new(format!("{base}/token"))
            .map_err(|e| Error::Config(format!("bad token url: {e}")))?;
        let device_url = DeviceAuthorizationUrl::new(format!("{base}/devicecode"))
            .map_err(|e| Error::Config(format!("bad devicecode url: {e}")))?;

        // Public client: no secret, credentials go in the request body.
        Ok(
            BasicClient::new(ClientId::new(self.client_id.clone()), None, auth_url, Some(token_url))
                .set_device_authorization_url(device_url)
                .set_auth_type(AuthType::RequestBody),
        )
    }

    async fn refresh(&self, tokens: &TokenSet) -> Result<TokenSet> {
        let Some(refresh_token) = tokens.refresh_token.clone() else {
            return Err(Error::AuthSetupRequired(
                "no refresh token on file; run --auth-setup".into(),
            ));
        };

        let client = self.oauth_client()?;
        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .add_scope(Scope::new(IMAP_SCOPE.to_string()))
            .add_scope(Scope::new(OFFLINE_SCOPE.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| match &e {
                RequestTokenError::ServerResponse(server)
                    if *server.error() == BasicErrorResponseType::InvalidGrant =>
                {
                    Error::TokenRevoked(e.to_string())
                }
                _ => Error::TokenRefreshFailed(e.to_string()),
            })?;

        let refreshed = TokenSet {
            access_token: response.access_token().secret().clone(),
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().clone())
                .or(Some(refresh_token)),
            expires_at: Utc::now()
                + ChronoDuration::seconds(
                    response.expires_in().map_or(3600, |d| d.as_secs() as i64),
                ),
            scopes: tokens.scopes.clone(),
        };
        self.token_file.save(&refreshed)?;
        info!("refreshed Microsoft access token");
        Ok(refreshed)
    }

    async fn current(&self, force: bool) -> Result<TokenSet> {
        let mut cache = self.cache.lock().await;

        if cache.is_none() {
            *cache = self.token_file.load()?;
        }
        let Some(tokens) = cache.clone() else {
            return Err(Error::AuthSetupRequired(format!(
                "no tokens at {}; run --auth-setup",
                self.token_file.path().display()
            )));
        };

        if force || tokens.needs_refresh() {
            let refreshed = self.refresh(&tokens).await?;
            *cache = Some(refreshed.clone());
            return Ok(refreshed);
        }
        Ok(tokens)
    }
}

#[async_trait]
impl AuthProvider for MicrosoftAuth {
    async fn interactive_setup(&self) -> Result<TokenSet> {
        let client = self.oauth_client()?;

        let details: StandardDeviceAuthorizationResponse = client
            .exchange_device_code()
            .map_err(|e| Error::Config(format!("device code flow misconfigured: {e}")))?
            .add_scope(Scope::new(IMAP_SCOPE.to_string()))
            .add_scope(Scope::new(OFFLINE_SCOPE.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| Error::TokenRefreshFailed(format!("device code request failed: {e}")))?;

        println!(
            "Visit {} and enter code: {}",
            details.verification_uri().as_str(),
            details.user_code().secret()
        );

        let response = client
            .exchange_device_access_token(&details)
            .request_async(async_http_client, tokio::time::sleep, None)
            .await
            .map_err(|e| Error::TokenRefreshFailed(format!("device code exchange failed: {e}")))?;

        let tokens = TokenSet {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_at: Utc::now()
                + ChronoDuration::seconds(
                    response.expires_in().map_or(3600, |d| d.as_secs() as i64),
                ),
            scopes: vec![IMAP_SCOPE.to_string(), OFFLINE_SCOPE.to_string()],
        };
        self.token_file.save(&tokens)?;
        *self.cache.lock().await = Some(tokens.clone());
        info!(path = %self.token_file.path().display(), "Microsoft tokens persisted");
        Ok(tokens)
    }

    async fn access_token(&self) -> Result<String> {
        Ok(self.current(false).await?.access_token)
    }

    async fn force_refresh(&self) -> Result<String> {
        Ok(self.current(true).await?.access_token)
    }

    async fn revoke(&self) -> Result<()> {
        // The identity platform has no self-service revocation endpoint
        // for public clients; dropping the refresh token locally is the
        // supported teardown.
        self.token_file.delete()?;
        *self.cache.lock().await = None;
        info!("Microsoft tokens deleted");
        Ok(())
    }

    async fn info(&self) -> Result<TokenInfo> {
        let tokens = self.token_file.load()?.ok_or_else(|| {
            Error::AuthSetupRequired("no tokens on file; run --auth-setup".into())
        })?;
        Ok(TokenInfo::from(&tokens))
    }
}
