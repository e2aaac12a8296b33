//! Bilibili web cookie refresh.
//!
//! The handshake is a linear state machine:
//! 1. Check cookie status via `/cookie/info`
//! 2. Generate the correspond path
//! 3. Fetch `refresh_csrf` from the correspond page
//! 4. Post the refresh, collecting new cookies and refresh token
//! 5. Confirm, which retires the old refresh token
//!
//! The coordinator never mutates its credentials. New values are reported in
//! [`RefreshResult`] for the caller to adopt.

use std::collections::BTreeMap;
use std::fmt;

use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::BilibiliEndpoints;
use super::cookie_utils::{extract_refresh_csrf, merge_cookies, parse_set_cookies};
use super::credentials::{BILI_JCT, BilibiliCredentials};
use crate::default::{DEFAULT_UA, unix_millis};

#[derive(Debug, Error)]
pub enum CookieRefreshError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("{step} returned code {code}: {message}")]
    Api {
        step: &'static str,
        code: i64,
        message: String,
    },
    #[error("refresh_csrf not found in correspond page (HTTP status: {0})")]
    CsrfNotFound(u16),
    #[error("System time error")]
    SystemTime,
}

/// Cookie status reported by the cookie info endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CookieStatus {
    /// Cookies are valid, no refresh needed
    Valid,
    /// Server asks for a refresh
    NeedsRefresh { timestamp: Option<i64> },
    /// Not logged in or rejected
    Invalid { code: i64, message: String },
}

/// Outcome of one coordinator run.
#[derive(Clone, Default, Serialize)]
pub struct RefreshResult {
    pub success: bool,
    pub message: String,
    pub new_refresh_token: Option<String>,
    /// Every cookie set by the refresh response, by name.
    pub new_cookies: BTreeMap<String, String>,
}

impl RefreshResult {
    fn not_needed() -> Self {
        Self {
            success: true,
            message: "Cookie refresh not needed".to_string(),
            ..Default::default()
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Default::default()
        }
    }

    /// Whether the run produced values the caller must adopt.
    pub fn has_updates(&self) -> bool {
        self.new_refresh_token.is_some() || !self.new_cookies.is_empty()
    }
}

impl fmt::Debug for RefreshResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshResult")
            .field("success", &self.success)
            .field("message", &self.message)
            .field("has_new_refresh_token", &self.new_refresh_token.is_some())
            .field("new_cookies", &self.new_cookies.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CookieInfoData {
    #[serde(default)]
    refresh: bool,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RefreshData {
    refresh_token: Option<String>,
}

/// Hex SHA-256 of `"<millis>_<nonce>"`.
pub fn generate_correspond_path(timestamp_ms: u64, nonce: i64) -> String {
    let digest = Sha256::digest(format!("{timestamp_ms}_{nonce}").as_bytes());
    hex::encode(digest)
}

enum RefreshState {
    Idle,
    ProbeStatus,
    GenerateCorrespondPath,
    FetchRefreshCsrf {
        correspond_path: String,
    },
    PostRefresh {
        refresh_csrf: String,
    },
    PostConfirm {
        new_refresh_token: String,
        new_cookies: BTreeMap<String, String>,
    },
    Done(RefreshResult),
}

impl RefreshState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ProbeStatus => "cookie info",
            Self::GenerateCorrespondPath => "correspond path",
            Self::FetchRefreshCsrf { .. } => "refresh csrf",
            Self::PostRefresh { .. } => "cookie refresh",
            Self::PostConfirm { .. } => "confirm refresh",
            Self::Done(_) => "done",
        }
    }
}

/// Runs the refresh handshake for one session. Runs are serialized.
pub struct CookieRefreshCoordinator {
    client: Client,
    endpoints: BilibiliEndpoints,
    credentials: BilibiliCredentials,
    run_lock: Mutex<()>,
}

impl CookieRefreshCoordinator {
    pub fn new(
        client: Client,
        endpoints: BilibiliEndpoints,
        credentials: BilibiliCredentials,
    ) -> Self {
        Self {
            client,
            endpoints,
            credentials,
            run_lock: Mutex::new(()),
        }
    }

    pub fn credentials(&self) -> &BilibiliCredentials {
        &self.credentials
    }

    /// Drive the state machine to completion. Never retries a step.
    #[instrument(skip(self))]
    pub async fn run(&self) -> RefreshResult {
        let _guard = self.run_lock.lock().await;

        let mut state = RefreshState::Idle;
        loop {
            state = match state {
                RefreshState::Done(result) => {
                    if result.success {
                        info!(message = %result.message, "Cookie refresh finished");
                    } else {
                        warn!(message = %result.message, "Cookie refresh failed");
                    }
                    return result;
                }
                state => {
                    let step = state.name();
                    debug!(step, "Cookie refresh step");
                    match self.advance(state).await {
                        Ok(next) => next,
                        Err(e) => RefreshState::Done(RefreshResult::failed(format!("{step}: {e}"))),
                    }
                }
            };
        }
    }

    async fn advance(&self, state: RefreshState) -> Result<RefreshState, CookieRefreshError> {
        match state {
            RefreshState::Idle => self.start(),
            RefreshState::ProbeStatus => self.probe_status().await,
            RefreshState::GenerateCorrespondPath => self.correspond_path(),
            RefreshState::FetchRefreshCsrf { correspond_path } => {
                self.fetch_refresh_csrf(&correspond_path).await
            }
            RefreshState::PostRefresh { refresh_csrf } => self.post_refresh(&refresh_csrf).await,
            RefreshState::PostConfirm {
                new_refresh_token,
                new_cookies,
            } => self.post_confirm(new_refresh_token, new_cookies).await,
            done @ RefreshState::Done(_) => Ok(done),
        }
    }

    fn csrf(&self) -> Result<&str, CookieRefreshError> {
        self.credentials
            .csrf()
            .ok_or(CookieRefreshError::MissingCredential(BILI_JCT))
    }

    fn refresh_token(&self) -> Result<&str, CookieRefreshError> {
        self.credentials
            .refresh_token
            .as_deref()
            .ok_or(CookieRefreshError::MissingCredential("refresh_token"))
    }

    fn start(&self) -> Result<RefreshState, CookieRefreshError> {
        self.csrf()?;
        Ok(RefreshState::ProbeStatus)
    }

    async fn probe_status(&self) -> Result<RefreshState, CookieRefreshError> {
        Ok(match self.check_status().await? {
            CookieStatus::NeedsRefresh { timestamp } => {
                info!(?timestamp, "Cookies need refresh");
                RefreshState::GenerateCorrespondPath
            }
            CookieStatus::Valid => RefreshState::Done(RefreshResult::not_needed()),
            CookieStatus::Invalid { code, message } => RefreshState::Done(RefreshResult::failed(
                format!("cookie info returned code {code}: {message}"),
            )),
        })
    }

    /// Query the cookie info endpoint without refreshing.
    pub async fn check_status(&self) -> Result<CookieStatus, CookieRefreshError> {
        let csrf = self.csrf()?;
        let body: ApiResponse<CookieInfoData> = self
            .client
            .get(&self.endpoints.cookie_info)
            .query(&[("csrf", csrf)])
            .header(header::COOKIE, self.credentials.cookie_header())
            .header(header::USER_AGENT, DEFAULT_UA)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| CookieRefreshError::Parse(e.to_string()))?;

        if body.code != 0 {
            return Ok(CookieStatus::Invalid {
                code: body.code,
                message: body.message,
            });
        }

        Ok(match body.data {
            Some(data) if data.refresh => CookieStatus::NeedsRefresh {
                timestamp: data.timestamp,
            },
            _ => CookieStatus::Valid,
        })
    }

    fn correspond_path(&self) -> Result<RefreshState, CookieRefreshError> {
        self.refresh_token()?;
        let timestamp_ms = unix_millis().map_err(|_| CookieRefreshError::SystemTime)?;
        let correspond_path = generate_correspond_path(timestamp_ms, rand::random::<i64>());
        Ok(RefreshState::FetchRefreshCsrf { correspond_path })
    }

    async fn fetch_refresh_csrf(
        &self,
        correspond_path: &str,
    ) -> Result<RefreshState, CookieRefreshError> {
        let url = format!("{}{correspond_path}", self.endpoints.correspond);
        let response = self
            .client
            .get(&url)
            .header(header::COOKIE, self.credentials.cookie_header())
            .header(header::USER_AGENT, DEFAULT_UA)
            .send()
            .await?;

        let status = response.status();
        let html = response.text().await?;
        let refresh_csrf =
            extract_refresh_csrf(&html).ok_or(CookieRefreshError::CsrfNotFound(status.as_u16()))?;
        Ok(RefreshState::PostRefresh { refresh_csrf })
    }

    async fn post_refresh(&self, refresh_csrf: &str) -> Result<RefreshState, CookieRefreshError> {
        let form = [
            ("csrf", self.csrf()?),
            ("refresh_csrf", refresh_csrf),
            ("source", "main_web"),
            ("refresh_token", self.refresh_token()?),
        ];

        let response = self
            .client
            .post(&self.endpoints.refresh)
            .header(header::COOKIE, self.credentials.cookie_header())
            .header(header::USER_AGENT, DEFAULT_UA)
            .form(&form)
            .send()
            .await?;

        // Extract new cookies from Set-Cookie headers
        let new_cookies = parse_set_cookies(response.headers());

        let body: ApiResponse<RefreshData> = response
            .json()
            .await
            .map_err(|e| CookieRefreshError::Parse(e.to_string()))?;
        if body.code != 0 {
            return Err(CookieRefreshError::Api {
                step: "cookie refresh",
                code: body.code,
                message: body.message,
            });
        }

        let new_refresh_token = body
            .data
            .and_then(|d| d.refresh_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CookieRefreshError::Parse("missing new refresh_token".to_string()))?;

        debug!(
            cookies = ?new_cookies.keys().collect::<Vec<_>>(),
            "Received refreshed cookies"
        );
        Ok(RefreshState::PostConfirm {
            new_refresh_token,
            new_cookies,
        })
    }

    async fn post_confirm(
        &self,
        new_refresh_token: String,
        new_cookies: BTreeMap<String, String>,
    ) -> Result<RefreshState, CookieRefreshError> {
        let csrf = match new_cookies.get(BILI_JCT) {
            Some(jct) => jct.as_str(),
            None => self.csrf()?,
        };
        let form = [("csrf", csrf), ("refresh_token", self.refresh_token()?)];
        let cookies = merge_cookies(&self.credentials.cookie_header(), &new_cookies);

        let body: ApiResponse<serde_json::Value> = self
            .client
            .post(&self.endpoints.confirm)
            .header(header::COOKIE, cookies)
            .header(header::USER_AGENT, DEFAULT_UA)
            .form(&form)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| CookieRefreshError::Parse(e.to_string()))?;

        // The new cookies are live even if confirmation fails, so report them either way.
        let (success, message) = if body.code == 0 {
            (true, "Cookies refreshed".to_string())
        } else {
            (
                false,
                format!("confirm refresh returned code {}: {}", body.code, body.message),
            )
        };

        Ok(RefreshState::Done(RefreshResult {
            success,
            message,
            new_refresh_token: Some(new_refresh_token),
            new_cookies,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_correspond_path() {
        assert_eq!(
            generate_correspond_path(1_700_000_000_000, 42),
            "96f532b61daa15ba1f593a26e5c06577c211bf13611b32ea6d52553472d0a099"
        );
        let path = generate_correspond_path(1_700_000_000_000, -7);
        assert_eq!(path.len(), 64);
        assert!(path.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_missing_csrf_fails_without_network() {
        let coordinator = CookieRefreshCoordinator::new(
            Client::new(),
            BilibiliEndpoints::with_base("http://127.0.0.1:9"),
            BilibiliCredentials::default(),
        );
        let result = coordinator.run().await;
        assert!(!result.success);
        assert!(result.message.contains("bili_jct"));
        assert!(!result.has_updates());
    }

    #[test]
    fn test_result_debug_hides_values() {
        let result = RefreshResult {
            success: true,
            message: "ok".to_string(),
            new_refresh_token: Some("rt-secret".to_string()),
            new_cookies: BTreeMap::from([("SESSDATA".to_string(), "sess-secret".to_string())]),
        };
        let debug = format!("{result:?}");
        assert!(debug.contains("SESSDATA"));
        assert!(!debug.contains("sess-secret"));
        assert!(!debug.contains("rt-secret"));
    }
}
