//! Google OAuth2 (authorization code + PKCE, loopback redirect)
//!
//! Interactive setup opens an authorization URL, catches the redirect
//! on an ephemeral loopback listener, and exchanges the code. After
//! that the stored refresh token keeps the producer running headless.

use super::{AuthProvider, TokenFile, TokenInfo, TokenSet};
use crate::config::AuthConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponseType};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
const MAIL_SCOPE: &str = "https://mail.google.com/";

/// Google OAuth2 provider.
pub struct GoogleAuth {
    client_id: String,
    client_secret: Option<String>,
    token_file: TokenFile,
    cache: tokio::sync::Mutex<Option<TokenSet>>,
}

impl GoogleAuth {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let client_id = config
            .google_client_id
            .clone()
            .ok_or_else(|| Error::Config("GOOGLE_CLIENT_ID not set".into()))?;
        Ok(Self {
            client_id,
            client_secret: config.google_client_secret.clone(),
            token_file: TokenFile::new(config.token_file.clone()),
            cache: tokio::sync::Mutex::new(None),
        })
    }

    fn oauth_client(&self, redirect_uri: Option<String>) -> Result<BasicClient> {
        let auth_url = AuthUrl::new(AUTH_URL.to_string())
            .map_err(|e| Error::Config(format!("bad auth url: {e}")))?;
        let token_url = TokenUrl::new(TOKEN_URL.to_string())
            .map_err(|e| Error::Config(format!("bad token url: {e}")))?;

        let mut client = BasicClient::new(
            ClientId::new(self.client_id.clone()),
            self.client_secret.clone().map(ClientSecret::new),
            auth_url,
            Some(token_url),
        );
        if let Some(uri) = redirect_uri {
            client = client.set_redirect_uri(
                RedirectUrl::new(uri).map_err(|e| Error::Config(format!("bad redirect: {e}")))?,
            );
        }
        Ok(client)
    }

    async fn refresh(&self, tokens: &TokenSet) -> Result<TokenSet> {
        let Some(refresh_token) = tokens.refresh_token.clone() else {
            return Err(Error::AuthSetupRequired(
                "no refresh token on file; run --auth-setup".into(),
            ));
        };

        let client = self.oauth_client(None)?;
        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
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
            // Google often omits the refresh token on refresh; keep ours.
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
        info!("refreshed Google access token");
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
impl AuthProvider for GoogleAuth {
    async fn interactive_setup(&self) -> Result<TokenSet> {
        // Bind first so the redirect cannot race the listener.
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{port}");

        let client = self.oauth_client(Some(redirect_uri))?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (auth_url, csrf_token) = client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(MAIL_SCOPE.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .set_pkce_challenge(pkce_challenge)
            .url();

        println!("Open this URL in your browser:\n{auth_url}");

        let code = catch_loopback_redirect(&listener, csrf_token.secret()).await?;

        let response = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(pkce_verifier)
            .request_async(async_http_client)
            .await
            .map_err(|e| Error::TokenRefreshFailed(format!("code exchange failed: {e}")))?;

        let tokens = TokenSet {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_at: Utc::now()
                + ChronoDuration::seconds(
                    response.expires_in().map_or(3600, |d| d.as_secs() as i64),
                ),
            scopes: vec![MAIL_SCOPE.to_string()],
        };
        if tokens.refresh_token.is_none() {
            warn!("Google did not return a refresh token; headless refresh will not work");
        }
        self.token_file.save(&tokens)?;
        *self.cache.lock().await = Some(tokens.clone());
        info!(path = %self.token_file.path().display(), "Google tokens persisted");
        Ok(tokens)
    }

    async fn access_token(&self) -> Result<String> {
        Ok(self.current(false).await?.access_token)
    }

    async fn force_refresh(&self) -> Result<String> {
        Ok(self.current(true).await?.access_token)
    }

    async fn revoke(&self) -> Result<()> {
        let tokens = self
            .token_file
            .load()?
            .ok_or_else(|| Error::AuthSetupRequired("no tokens to revoke".into()))?;
        let target = tokens
            .refresh_token
            .unwrap_or_else(|| tokens.access_token.clone());

        let client = reqwest::Client::new();
        let response = client
            .post(REVOKE_URL)
            .form(&[("token", target)])
            .send()
            .await
            .map_err(|e| Error::TokenRevoked(format!("revocation request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::TokenRevoked(format!(
                "revocation rejected: {}",
                response.status()
            )));
        }

        self.token_file.delete()?;
        *self.cache.lock().await = None;
        info!("Google tokens revoked and deleted");
        Ok(())
    }

    async fn info(&self) -> Result<TokenInfo> {
        let tokens = self.token_file.load()?.ok_or_else(|| {
            Error::AuthSetupRequired("no tokens on file; run --auth-setup".into())
        })?;
        Ok(TokenInfo::from(&tokens))
    }
}

/// Accept exactly one loopback connection and extract the `code` query
/// parameter, verifying the CSRF state.
async fn catch_loopback_redirect(listener: &TcpListener, expected_state: &str) -> Result<String> {
    let (mut socket, _addr) = listener.accept().await?;

    let mut buf = vec![0u8; 4096];
    let n = socket.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // "GET /?code=...&state=... HTTP/1.1"
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| Error::TokenRefreshFailed("malformed redirect request".into()))?;
    let parsed = url::Url::parse(&format!("http://127.0.0.1{path}"))
        .map_err(|e| Error::TokenRefreshFailed(format!("malformed redirect url: {e}")))?;

    let mut code = None;
    let mut state = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }

    let body = if code.is_some() {
        "Authorization received. You can close this tab."
    } else {
        "No authorization code in redirect. You can close this tab."
    };
    let reply = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let _ = socket.write_all(reply.as_bytes()).await;

    if state.as_deref() != Some(expected_state) {
        return Err(Error::TokenRefreshFailed("CSRF state mismatch".into()));
    }
    code.ok_or_else(|| Error::TokenRefreshFailed("no code in redirect".into()))
}
