//! Network exchanges that mint Spotify access tokens.
//!
//! - Client credentials: OAuth grant with the configured client id/secret
//! - Anonymous: web-player token endpoint authorized by two TOTP codes
//! - Account: same endpoint, scoped to a user through the `sp_dc` cookie

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, header};
use tracing::{debug, instrument, warn};
use url::Url;

use super::SpotifyEndpoints;
use super::models::{
    ClientCredentialsResponse, ServerTimeResponse, WebTokenResponse, error_message,
};
use super::secret::SecretResolver;
use super::totp::{DIGITS, LOCAL_PERIOD_SECS, SERVER_PERIOD_SECS, generate_totp};
use crate::default::{DEFAULT_UA, unix_millis, unix_secs};
use crate::error::AuthError;
use crate::token::{Token, TokenKind};

const APP_PLATFORM: &str = "WebPlayer";

/// Server times below this are taken to be seconds rather than milliseconds.
const SECONDS_THRESHOLD: i64 = 100_000_000_000;

/// A source of access tokens of one kind.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn kind(&self) -> TokenKind;

    /// Perform the network exchange. Never consults a cache.
    async fn fetch_token(&self) -> Result<Token, AuthError>;
}

/// Server-reported time in epoch milliseconds, or local time if the request fails.
pub async fn fetch_server_time_ms(client: &Client, url: &str, sp_dc: Option<&str>) -> u64 {
    match try_fetch_server_time(client, url, sp_dc).await {
        Ok(ms) => ms,
        Err(e) => {
            debug!(error = %e, "Failed to get server time, using local time");
            unix_millis().unwrap_or_default()
        }
    }
}

async fn try_fetch_server_time(
    client: &Client,
    url: &str,
    sp_dc: Option<&str>,
) -> Result<u64, AuthError> {
    let mut request = client.get(url).header(header::USER_AGENT, DEFAULT_UA);
    if let Some(sp_dc) = sp_dc {
        request = request.header(header::COOKIE, format!("sp_dc={sp_dc}"));
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(AuthError::status("server-time", response.status()));
    }

    let body: ServerTimeResponse = response.json().await?;
    match body.server_time {
        Some(t) if t <= 0 => Err(AuthError::Parse(format!("invalid serverTime {t}"))),
        Some(t) if t < SECONDS_THRESHOLD => Ok(t as u64 * 1000),
        Some(t) => Ok(t as u64),
        None => Err(AuthError::Parse("missing serverTime".to_string())),
    }
}

/// Token endpoint URL with the TOTP query the web player sends.
pub fn build_token_url(
    token_endpoint: &str,
    local_code: &str,
    version: &str,
    server_code: &str,
) -> Result<String, AuthError> {
    let url = Url::parse_with_params(
        token_endpoint,
        [
            ("reason", "init"),
            ("productType", "web-player"),
            ("totp", local_code),
            ("totpVer", version),
            ("totpServer", server_code),
        ],
    )
    .map_err(|e| AuthError::Configuration(format!("invalid token endpoint: {e}")))?;
    Ok(url.into())
}

/// Resolve the secret, derive both codes and build the token URL.
async fn totp_token_url(
    client: &Client,
    endpoints: &SpotifyEndpoints,
    secrets: &SecretResolver,
    sp_dc: Option<&str>,
) -> Result<String, AuthError> {
    let secret = secrets.resolve().await?;
    let server_secs = fetch_server_time_ms(client, &endpoints.server_time, sp_dc).await / 1000;
    let local_secs = unix_secs()?;

    let local_code = generate_totp(secret.key(), local_secs, LOCAL_PERIOD_SECS, DIGITS)?;
    let server_code = generate_totp(secret.key(), server_secs, SERVER_PERIOD_SECS, DIGITS)?;

    build_token_url(&endpoints.token, &local_code, secret.version(), &server_code)
}

/// Send a web-player token request and turn the response into a [`Token`].
async fn exchange_web_token(request: RequestBuilder, kind: TokenKind) -> Result<Token, AuthError> {
    let endpoint = format!("{kind} token endpoint");
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;

    let parsed: WebTokenResponse = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(_) if !status.is_success() => return Err(AuthError::status(endpoint, status)),
        Err(e) => return Err(AuthError::Parse(format!("{endpoint}: {e}"))),
    };

    if let Some(message) = error_message(parsed.error.as_ref()) {
        warn!(%kind, %status, "Token endpoint returned an error");
        return Err(AuthError::protocol(endpoint, message));
    }
    if !status.is_success() {
        return Err(AuthError::status(endpoint, status));
    }
    if kind == TokenKind::Account && parsed.is_anonymous {
        return Err(AuthError::Configuration(
            "sp_dc cookie is invalid or expired".to_string(),
        ));
    }

    let value = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::Parse(format!("{endpoint}: missing accessToken")))?;
    let expires_ms = parsed.expiration_ms.ok_or_else(|| {
        AuthError::Parse(format!("{endpoint}: missing accessTokenExpirationTimestampMs"))
    })?;

    Token::expiring_at_millis(kind, value, expires_ms)
}

/// OAuth client-credentials grant.
pub struct ClientCredentialsProvider {
    client: Client,
    endpoint: String,
    client_id: String,
    client_secret: String,
}

impl ClientCredentialsProvider {
    pub fn new(
        client: Client,
        endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(AuthError::Configuration(
                "client id and client secret are required".to_string(),
            ));
        }
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            client_id,
            client_secret,
        })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsProvider {
    fn kind(&self) -> TokenKind {
        TokenKind::ClientCredentials
    }

    #[instrument(skip(self))]
    async fn fetch_token(&self) -> Result<Token, AuthError> {
        debug!("Requesting client-credentials token");
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let parsed: ClientCredentialsResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(AuthError::status("client-credentials endpoint", status));
            }
            Err(e) => return Err(AuthError::Parse(format!("client-credentials response: {e}"))),
        };

        if let Some(error) = error_message(parsed.error.as_ref()) {
            let message = match parsed.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            };
            return Err(AuthError::protocol("client-credentials endpoint", message));
        }
        if !status.is_success() {
            return Err(AuthError::status("client-credentials endpoint", status));
        }

        let value = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Parse("missing access_token".to_string()))?;

        Token::expiring_in_secs(
            TokenKind::ClientCredentials,
            value,
            parsed.expires_in.unwrap_or(0),
        )
    }
}

/// Anonymous web-player token.
pub struct AnonymousTokenProvider {
    client: Client,
    endpoints: SpotifyEndpoints,
    secrets: Arc<SecretResolver>,
    custom_endpoint: Option<String>,
    sp_dc: Option<String>,
}

impl AnonymousTokenProvider {
    pub fn new(client: Client, endpoints: SpotifyEndpoints, secrets: Arc<SecretResolver>) -> Self {
        Self {
            client,
            endpoints,
            secrets,
            custom_endpoint: None,
            sp_dc: None,
        }
    }

    /// Use `endpoint` verbatim instead of deriving a TOTP-signed URL.
    pub fn with_custom_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.custom_endpoint = endpoint.filter(|e| !e.trim().is_empty());
        self
    }

    /// Cookie forwarded to the server-time request only.
    pub fn with_session_cookie(mut self, sp_dc: Option<String>) -> Self {
        self.sp_dc = sp_dc.filter(|c| !c.is_empty());
        self
    }

    async fn token_url(&self) -> Result<String, AuthError> {
        match &self.custom_endpoint {
            Some(endpoint) => {
                debug!("Using custom token endpoint");
                Ok(endpoint.clone())
            }
            None => {
                debug!("Using generated token URL with TOTP");
                totp_token_url(
                    &self.client,
                    &self.endpoints,
                    &self.secrets,
                    self.sp_dc.as_deref(),
                )
                .await
            }
        }
    }
}

#[async_trait]
impl TokenProvider for AnonymousTokenProvider {
    fn kind(&self) -> TokenKind {
        TokenKind::Anonymous
    }

    #[instrument(skip(self))]
    async fn fetch_token(&self) -> Result<Token, AuthError> {
        let url = self.token_url().await?;
        let request = self.client.get(url).header(header::USER_AGENT, DEFAULT_UA);
        let token = exchange_web_token(request, TokenKind::Anonymous).await?;
        debug!(expires_at = ?token.expires_at(), "Refreshed anonymous access token");
        Ok(token)
    }
}

/// Account-scoped web-player token.
pub struct AccountTokenProvider {
    client: Client,
    endpoints: SpotifyEndpoints,
    secrets: Arc<SecretResolver>,
    custom_endpoint: Option<String>,
    sp_dc: String,
}

impl AccountTokenProvider {
    /// Fails with a configuration error when `sp_dc` is empty.
    pub fn new(
        client: Client,
        endpoints: SpotifyEndpoints,
        secrets: Arc<SecretResolver>,
        sp_dc: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let sp_dc = sp_dc.into();
        if sp_dc.is_empty() {
            return Err(AuthError::Configuration(
                "sp_dc cookie is required for account tokens".to_string(),
            ));
        }
        Ok(Self {
            client,
            endpoints,
            secrets,
            custom_endpoint: None,
            sp_dc,
        })
    }

    pub fn with_custom_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.custom_endpoint = endpoint.filter(|e| !e.trim().is_empty());
        self
    }
}

#[async_trait]
impl TokenProvider for AccountTokenProvider {
    fn kind(&self) -> TokenKind {
        TokenKind::Account
    }

    #[instrument(skip(self))]
    async fn fetch_token(&self) -> Result<Token, AuthError> {
        let url = match &self.custom_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => {
                totp_token_url(
                    &self.client,
                    &self.endpoints,
                    &self.secrets,
                    Some(&self.sp_dc),
                )
                .await?
            }
        };

        let request = self
            .client
            .get(url)
            .header(header::USER_AGENT, DEFAULT_UA)
            .header("App-Platform", APP_PLATFORM)
            .header(header::COOKIE, format!("sp_dc={}", self.sp_dc));

        exchange_web_token(request, TokenKind::Account)
            .await
            .inspect_err(|e| warn!(error = %e, "Account token refreshing failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_token_url() {
        let url = build_token_url("https://open.spotify.com/api/token", "123456", "61", "654321")
            .unwrap();
        assert_eq!(
            url,
            "https://open.spotify.com/api/token?reason=init&productType=web-player&totp=123456&totpVer=61&totpServer=654321"
        );
    }

    #[test]
    fn test_build_token_url_rejects_garbage() {
        let err = build_token_url("not a url", "1", "2", "3").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_account_provider_requires_cookie() {
        let client = Client::new();
        let endpoints = SpotifyEndpoints::default();
        let secrets = Arc::new(SecretResolver::new(client.clone(), endpoints.clone()));
        let err = AccountTokenProvider::new(client, endpoints, secrets, "")
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_client_credentials_provider_requires_both_halves() {
        let err = ClientCredentialsProvider::new(Client::new(), "http://localhost", "id", "")
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }
}
