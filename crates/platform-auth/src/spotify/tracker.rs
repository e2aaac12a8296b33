use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::Client;
use tracing::{debug, info};

use super::SpotifyEndpoints;
use super::providers::{
    AccountTokenProvider, AnonymousTokenProvider, ClientCredentialsProvider, TokenProvider,
};
use super::secret::SecretResolver;
use crate::cache::ExpiringCell;
use crate::error::AuthError;
use crate::token::{Token, TokenKind};

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Everything the tracker needs to pick and run a token exchange.
#[derive(Clone, Default)]
pub struct SpotifyCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Web session cookie used for account-scoped tokens.
    pub sp_dc: Option<String>,
    /// When set, anonymous tokens are fetched from this URL verbatim.
    pub custom_token_endpoint: Option<String>,
    pub prefer_anonymous: bool,
}

impl SpotifyCredentials {
    pub fn has_client_credentials(&self) -> bool {
        non_empty(&self.client_id) && non_empty(&self.client_secret)
    }

    pub fn has_session_cookie(&self) -> bool {
        non_empty(&self.sp_dc)
    }

    pub fn has_custom_token_endpoint(&self) -> bool {
        non_empty(&self.custom_token_endpoint)
    }
}

impl fmt::Debug for SpotifyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpotifyCredentials")
            .field("client_id", &self.client_id)
            .field("has_client_secret", &non_empty(&self.client_secret))
            .field("has_sp_dc", &self.has_session_cookie())
            .field("custom_token_endpoint", &self.custom_token_endpoint)
            .field("prefer_anonymous", &self.prefer_anonymous)
            .finish()
    }
}

/// Why an anonymous token was chosen over client credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonymousReason {
    CustomEndpoint,
    MissingClientCredentials,
    Preferred,
}

/// Which exchange serves a plain `access_token` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStrategy {
    ClientCredentials,
    Anonymous(AnonymousReason),
    Account,
}

impl TokenStrategy {
    /// Selection policy for the default token.
    ///
    /// A custom endpoint always wins, then missing client credentials, then the
    /// caller's or configuration's preference.
    pub fn select(credentials: &SpotifyCredentials, prefer_anonymous: bool) -> Self {
        if credentials.has_custom_token_endpoint() {
            Self::Anonymous(AnonymousReason::CustomEndpoint)
        } else if !credentials.has_client_credentials() {
            Self::Anonymous(AnonymousReason::MissingClientCredentials)
        } else if prefer_anonymous || credentials.prefer_anonymous {
            Self::Anonymous(AnonymousReason::Preferred)
        } else {
            Self::ClientCredentials
        }
    }

    pub fn kind(&self) -> TokenKind {
        match self {
            Self::ClientCredentials => TokenKind::ClientCredentials,
            Self::Anonymous(_) => TokenKind::Anonymous,
            Self::Account => TokenKind::Account,
        }
    }
}

/// Caches one token per kind and refreshes each on demand.
///
/// Concurrent callers asking for the same kind share a single exchange.
pub struct TokenTracker {
    client: Client,
    endpoints: SpotifyEndpoints,
    credentials: RwLock<SpotifyCredentials>,
    secrets: Arc<SecretResolver>,
    client_credentials: ExpiringCell<Token>,
    anonymous: ExpiringCell<Token>,
    account: ExpiringCell<Token>,
}

impl TokenTracker {
    pub fn new(client: Client, credentials: SpotifyCredentials) -> Self {
        Self::with_endpoints(client, credentials, SpotifyEndpoints::default())
    }

    pub fn with_endpoints(
        client: Client,
        credentials: SpotifyCredentials,
        endpoints: SpotifyEndpoints,
    ) -> Self {
        if credentials.has_custom_token_endpoint() {
            info!("Using custom token endpoint");
        } else {
            info!("Using default token endpoint with TOTP");
        }
        if credentials.has_session_cookie() {
            info!("Account token support enabled");
        }

        let secrets = Arc::new(SecretResolver::new(client.clone(), endpoints.clone()));
        Self {
            client,
            endpoints,
            credentials: RwLock::new(credentials),
            secrets,
            client_credentials: ExpiringCell::new(),
            anonymous: ExpiringCell::new(),
            account: ExpiringCell::new(),
        }
    }

    /// Replace the secret resolver, e.g. to change which sources it consults.
    pub fn with_secret_resolver(mut self, resolver: SecretResolver) -> Self {
        self.secrets = Arc::new(resolver);
        self
    }

    /// Snapshot of the current credentials.
    pub fn credentials(&self) -> SpotifyCredentials {
        self.credentials.read().clone()
    }

    pub fn secrets(&self) -> &SecretResolver {
        &self.secrets
    }

    pub fn strategy(&self, prefer_anonymous: bool) -> TokenStrategy {
        TokenStrategy::select(&self.credentials.read(), prefer_anonymous)
    }

    /// Token for general API access, chosen by [`TokenStrategy::select`].
    pub async fn access_token(&self, prefer_anonymous: bool) -> Result<Token, AuthError> {
        let strategy = self.strategy(prefer_anonymous);
        debug!(?strategy, "Selected token strategy");
        self.token_for(strategy).await
    }

    pub async fn token_for(&self, strategy: TokenStrategy) -> Result<Token, AuthError> {
        match strategy {
            TokenStrategy::ClientCredentials => self.client_credentials_token().await,
            TokenStrategy::Anonymous(_) => self.anonymous_token().await,
            TokenStrategy::Account => self.account_token().await,
        }
    }

    pub async fn client_credentials_token(&self) -> Result<Token, AuthError> {
        let credentials = self.credentials();
        let (Some(id), Some(secret)) = (credentials.client_id, credentials.client_secret) else {
            return Err(AuthError::Configuration(
                "client id and client secret are not set".to_string(),
            ));
        };
        let provider = ClientCredentialsProvider::new(
            self.client.clone(),
            self.endpoints.client_credentials.clone(),
            id,
            secret,
        )?;
        self.client_credentials
            .get_or_refresh(|| provider.fetch_token())
            .await
    }

    pub async fn anonymous_token(&self) -> Result<Token, AuthError> {
        let credentials = self.credentials();
        let provider = AnonymousTokenProvider::new(
            self.client.clone(),
            self.endpoints.clone(),
            Arc::clone(&self.secrets),
        )
        .with_custom_endpoint(credentials.custom_token_endpoint)
        .with_session_cookie(credentials.sp_dc);
        self.anonymous.get_or_refresh(|| provider.fetch_token()).await
    }

    /// Account-scoped token. Fails without touching the network when no cookie is set.
    pub async fn account_token(&self) -> Result<Token, AuthError> {
        let credentials = self.credentials();
        let sp_dc = credentials
            .sp_dc
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AuthError::Configuration("sp_dc cookie is not set".to_string()))?;
        let provider = AccountTokenProvider::new(
            self.client.clone(),
            self.endpoints.clone(),
            Arc::clone(&self.secrets),
            sp_dc,
        )?
        .with_custom_endpoint(credentials.custom_token_endpoint);
        self.account.get_or_refresh(|| provider.fetch_token()).await
    }

    /// Cached token of `kind` without refreshing, if still valid.
    pub fn cached(&self, kind: TokenKind) -> Option<Token> {
        match kind {
            TokenKind::ClientCredentials => self.client_credentials.current(),
            TokenKind::Anonymous => self.anonymous.current(),
            TokenKind::Account => self.account.current(),
            TokenKind::MediaApi => None,
        }
    }

    pub fn set_client_credentials(&self, client_id: Option<String>, client_secret: Option<String>) {
        {
            let mut credentials = self.credentials.write();
            credentials.client_id = client_id;
            credentials.client_secret = client_secret;
        }
        self.client_credentials.invalidate();
        debug!("Client credentials updated");
    }

    pub fn set_session_cookie(&self, sp_dc: Option<String>) {
        self.credentials.write().sp_dc = sp_dc;
        self.account.invalidate();
        debug!("Session cookie updated");
    }

    /// Changing the endpoint drops both web-player tokens.
    pub fn set_custom_token_endpoint(&self, endpoint: Option<String>) {
        self.credentials.write().custom_token_endpoint = endpoint;
        self.anonymous.invalidate();
        self.account.invalidate();
        debug!("Custom token endpoint updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn creds(id: bool, custom: bool, cookie: bool) -> SpotifyCredentials {
        SpotifyCredentials {
            client_id: id.then(|| "id".to_string()),
            client_secret: id.then(|| "secret".to_string()),
            sp_dc: cookie.then(|| "cookie".to_string()),
            custom_token_endpoint: custom.then(|| "https://proxy.example/token".to_string()),
            prefer_anonymous: false,
        }
    }

    #[rstest]
    #[case::custom_endpoint_wins(true, true, false, TokenStrategy::Anonymous(AnonymousReason::CustomEndpoint))]
    #[case::no_credentials(false, false, false, TokenStrategy::Anonymous(AnonymousReason::MissingClientCredentials))]
    #[case::no_credentials_preferred(false, false, true, TokenStrategy::Anonymous(AnonymousReason::MissingClientCredentials))]
    #[case::preferred(true, false, true, TokenStrategy::Anonymous(AnonymousReason::Preferred))]
    #[case::client_credentials(true, false, false, TokenStrategy::ClientCredentials)]
    fn test_strategy_selection(
        #[case] has_id: bool,
        #[case] custom: bool,
        #[case] prefer: bool,
        #[case] expected: TokenStrategy,
    ) {
        assert_eq!(TokenStrategy::select(&creds(has_id, custom, false), prefer), expected);
    }

    #[test]
    fn test_configured_preference_counts() {
        let mut credentials = creds(true, false, false);
        credentials.prefer_anonymous = true;
        assert_eq!(
            TokenStrategy::select(&credentials, false),
            TokenStrategy::Anonymous(AnonymousReason::Preferred)
        );
    }

    #[test]
    fn test_blank_values_do_not_count() {
        let credentials = SpotifyCredentials {
            client_id: Some("  ".to_string()),
            client_secret: Some("secret".to_string()),
            custom_token_endpoint: Some(String::new()),
            ..Default::default()
        };
        assert!(!credentials.has_client_credentials());
        assert!(!credentials.has_custom_token_endpoint());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let debug = format!("{:?}", creds(true, false, true));
        assert!(!debug.contains("secret\""));
        assert!(!debug.contains("cookie\""));
    }

    #[tokio::test]
    async fn test_account_token_without_cookie_is_configuration_error() {
        let tracker = TokenTracker::new(Client::new(), creds(true, false, false));
        let err = tracker.account_token().await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_client_credentials_token_without_credentials() {
        let tracker = TokenTracker::new(Client::new(), SpotifyCredentials::default());
        let err = tracker.client_credentials_token().await.unwrap_err();
        assert!(err.is_configuration());
    }
}
