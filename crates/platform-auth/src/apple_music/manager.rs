use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::{Client, StatusCode, header};
use tracing::{debug, error, info, instrument, warn};

use super::AppleMusicEndpoints;
use super::token::{MediaApiToken, extract_token, module_script_url};
use crate::cache::{Expiring, ExpiringCell};
use crate::default::DEFAULT_UA;
use crate::error::AuthError;

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Holds the developer token and re-scrapes it on expiry in auto-fetch mode.
///
/// A manually supplied token is never replaced automatically; once it expires
/// every call fails with a configuration error until [`set_token`] is called.
///
/// [`set_token`]: MediaApiTokenManager::set_token
pub struct MediaApiTokenManager {
    client: Client,
    endpoints: AppleMusicEndpoints,
    auto_fetch: AtomicBool,
    cell: ExpiringCell<MediaApiToken>,
}

impl MediaApiTokenManager {
    pub fn new(client: Client, manual_token: Option<&str>) -> Result<Self, AuthError> {
        Self::with_endpoints(client, manual_token, AppleMusicEndpoints::default())
    }

    /// Parses `manual_token` up front; without one the first [`token`](Self::token)
    /// call scrapes the web player.
    pub fn with_endpoints(
        client: Client,
        manual_token: Option<&str>,
        endpoints: AppleMusicEndpoints,
    ) -> Result<Self, AuthError> {
        let manager = Self {
            client,
            endpoints,
            auto_fetch: AtomicBool::new(true),
            cell: ExpiringCell::new(),
        };

        match manual_token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(raw) => {
                manager.set_token(raw)?;
                info!("Media API token manager initialized with provided token");
            }
            None => info!("Media API token manager initialized in auto-fetch mode"),
        }
        Ok(manager)
    }

    pub fn is_auto_fetch(&self) -> bool {
        self.auto_fetch.load(Ordering::Acquire)
    }

    /// A usable token, scraping a new one first if needed and allowed.
    pub async fn token(&self) -> Result<MediaApiToken, AuthError> {
        if self.is_auto_fetch() {
            return self.cell.get_or_refresh(|| self.scrape()).await;
        }

        match self.cell.peek() {
            Some(token) if token.is_fresh() => Ok(token),
            Some(token) => {
                let expiry = token
                    .token()
                    .expires_at()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                Err(AuthError::Configuration(format!(
                    "media API token has expired (expiry: {expiry}), update the configured token"
                )))
            }
            None => Err(AuthError::Configuration(
                "media API token is not initialized".to_string(),
            )),
        }
    }

    /// Replace the token by hand. Disables auto-fetch.
    pub fn set_token(&self, raw: &str) -> Result<(), AuthError> {
        let token = MediaApiToken::parse(raw)
            .map_err(|e| AuthError::Configuration(format!("invalid media API token: {e}")))?;
        debug!(expires_at = ?token.token().expires_at(), "Media API token parsed");
        self.cell.store(token);
        self.auto_fetch.store(false, Ordering::Release);
        info!("Media API token manually updated, auto-fetch disabled");
        Ok(())
    }

    /// Scrape a new token even if the cached one is still valid.
    pub async fn fetch_new_token(&self) -> Result<MediaApiToken, AuthError> {
        self.cell.force_refresh(|| self.scrape()).await
    }

    #[instrument(skip(self))]
    async fn scrape(&self) -> Result<MediaApiToken, AuthError> {
        info!("Fetching new media API token from web");
        let result = self.scrape_inner().await;
        if let Err(e) = &result {
            error!(error = %e, "Failed to fetch new media API token");
        }
        result
    }

    async fn scrape_inner(&self) -> Result<MediaApiToken, AuthError> {
        let html = self.fetch_page(&self.endpoints.browse).await?;
        let script_url = module_script_url(&html, &self.endpoints.origin)
            .ok_or_else(|| AuthError::Parse("token script url not found in page".to_string()))?;
        debug!(url = %script_url, "Token script url found");

        let script = self.fetch_page(&script_url).await?;
        let raw = extract_token(&script)
            .ok_or_else(|| AuthError::Parse("token not found in script".to_string()))?;

        if self.cell.peek().is_some_and(|old| old.value() == raw) {
            warn!("Fetched media API token is identical to the previous one");
        }

        let token = MediaApiToken::parse(raw)?;
        info!(expires_at = ?token.token().expires_at(), "Fetched media API token");
        Ok(token)
    }

    async fn fetch_page(&self, url: &str) -> Result<String, AuthError> {
        let response = self
            .client
            .get(url)
            .header(header::USER_AGENT, DEFAULT_UA)
            .header(header::ACCEPT, ACCEPT_HTML)
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(AuthError::status(url, response.status()));
        }
        Ok(response.text().await?)
    }
}
