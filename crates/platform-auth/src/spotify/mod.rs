mod models;
mod providers;
pub mod secret;
pub mod totp;
mod tracker;

pub use providers::{
    AccountTokenProvider, AnonymousTokenProvider, ClientCredentialsProvider, TokenProvider,
    build_token_url, fetch_server_time_ms,
};
pub use secret::{Secret, SecretResolver, SecretSource};
pub use tracker::{AnonymousReason, SpotifyCredentials, TokenStrategy, TokenTracker};

/// Default endpoints used by the web player.
pub mod urls {
    pub const TOKEN: &str = "https://open.spotify.com/api/token";
    pub const SERVER_TIME: &str = "https://open.spotify.com/api/server-time";
    pub const CLIENT_CREDENTIALS: &str = "https://accounts.spotify.com/api/token";
    pub const SECRETS_REGISTRY: &str =
        "https://raw.githubusercontent.com/xyloflake/spot-secrets-go/refs/heads/main/secrets/secretDict.json";
    pub const HOMEPAGE: &str = "https://open.spotify.com/";
}

/// Endpoint set, overridable for proxies and tests.
#[derive(Debug, Clone)]
pub struct SpotifyEndpoints {
    pub token: String,
    pub server_time: String,
    pub client_credentials: String,
    pub secrets_registry: String,
    pub homepage: String,
}

impl Default for SpotifyEndpoints {
    fn default() -> Self {
        Self {
            token: urls::TOKEN.to_string(),
            server_time: urls::SERVER_TIME.to_string(),
            client_credentials: urls::CLIENT_CREDENTIALS.to_string(),
            secrets_registry: urls::SECRETS_REGISTRY.to_string(),
            homepage: urls::HOMEPAGE.to_string(),
        }
    }
}

impl SpotifyEndpoints {
    /// Every endpoint rooted at `base`, keeping the default paths.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            token: format!("{base}/api/token"),
            server_time: format!("{base}/api/server-time"),
            client_credentials: format!("{base}/accounts/api/token"),
            secrets_registry: format!("{base}/secrets/secretDict.json"),
            homepage: format!("{base}/"),
        }
    }
}
