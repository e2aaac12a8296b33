//! Per-platform request decoration.
//!
//! A [`RequestInterceptor`] adds the platform's headers and cookies to every
//! request it builds. When a response comes back 401 or 403 it starts the cookie
//! refresh coordinator in a detached task. The failed request is not retried and
//! the refresh result is only logged; adopting new cookies is left to the caller.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bilibili::cookie_utils::cookie_pairs;
use crate::bilibili::{BilibiliCredentials, BilibiliEndpoints, CookieRefreshCoordinator, RefreshResult};
use crate::default::DEFAULT_UA;
use crate::error::AuthError;

pub struct RequestInterceptor {
    platform: String,
    client: Client,
    // platform-specific headers
    headers: HeaderMap,
    cookies: RwLock<FxHashMap<String, String>>,
    coordinator: Option<Arc<CookieRefreshCoordinator>>,
    refresh_in_flight: Arc<AtomicBool>,
}

impl RequestInterceptor {
    pub fn new(platform: impl Into<String>, client: Client) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(DEFAULT_UA));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.8,en-US;q=0.5,en;q=0.3"),
        );

        Self {
            platform: platform.into(),
            client,
            headers,
            cookies: RwLock::new(FxHashMap::default()),
            coordinator: None,
            refresh_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Interceptor carrying Bilibili session cookies.
    ///
    /// A refresh coordinator is attached only when the credentials can refresh.
    pub fn bilibili(
        client: Client,
        endpoints: BilibiliEndpoints,
        credentials: BilibiliCredentials,
    ) -> Result<Self, AuthError> {
        let mut interceptor = Self::new("bilibili", client.clone());
        interceptor.set_origin_and_referer(&endpoints.referer)?;
        for (name, value) in credentials.cookies() {
            interceptor.add_cookie(name, value);
        }

        if credentials.can_refresh() {
            let coordinator = CookieRefreshCoordinator::new(client, endpoints, credentials);
            interceptor = interceptor.with_coordinator(Arc::new(coordinator));
        } else {
            debug!("Bilibili credentials cannot refresh, interceptor runs without coordinator");
        }
        Ok(interceptor)
    }

    pub fn with_coordinator(mut self, coordinator: Arc<CookieRefreshCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn has_coordinator(&self) -> bool {
        self.coordinator.is_some()
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), AuthError> {
        let name = HeaderName::from_str(name)
            .map_err(|e| AuthError::Configuration(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AuthError::Configuration(format!("invalid value for {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn set_origin_and_referer(&mut self, base_url: &str) -> Result<(), AuthError> {
        self.add_header(header::ORIGIN.as_str(), base_url)?;
        self.add_header(header::REFERER.as_str(), base_url)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn add_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.write().insert(name.into(), value.into());
    }

    /// Import cookies from a `name=value; ...` string.
    pub fn set_cookies_from_string(&self, cookie_string: &str) {
        let mut cookies = self.cookies.write();
        for (name, value) in cookie_pairs(cookie_string) {
            cookies.insert(name.to_owned(), value.to_owned());
        }
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies.read().get(name).cloned()
    }

    fn build_cookie_header(&self) -> Option<String> {
        let cookies = self.cookies.read();
        if cookies.is_empty() {
            return None;
        }

        let mut pairs: Vec<_> = cookies.iter().collect();
        pairs.sort_unstable();
        Some(
            pairs
                .into_iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Request with platform headers and stored cookies attached.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut headers = self.headers.clone();

        if let Some(cookie_header) = self.build_cookie_header() {
            match HeaderValue::from_str(&cookie_header) {
                Ok(value) => {
                    headers.insert(header::COOKIE, value);
                }
                Err(e) => {
                    // Skip the header rather than send an invalid value
                    debug!(error = %e, "Failed to build Cookie header");
                }
            }
        }

        self.client.request(method, url).headers(headers)
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Send `request` and react to authentication failures.
    ///
    /// The response is returned unchanged, whatever its status.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, AuthError> {
        let response = request.send().await?;
        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            warn!(platform = %self.platform, %status, url = %response.url(), "Request was rejected");
            self.on_auth_failure(status);
        }
        Ok(response)
    }

    /// Start a detached cookie refresh unless one is already running.
    ///
    /// Returns the task handle when a refresh was started.
    pub fn on_auth_failure(&self, status: StatusCode) -> Option<JoinHandle<RefreshResult>> {
        let Some(coordinator) = self.coordinator.clone() else {
            debug!(platform = %self.platform, %status, "No refresh coordinator configured");
            return None;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(platform = %self.platform, "No async runtime, skipping cookie refresh");
            return None;
        };

        if self.refresh_in_flight.swap(true, Ordering::AcqRel) {
            debug!(platform = %self.platform, "Cookie refresh already in flight");
            return None;
        }

        info!(platform = %self.platform, %status, "Triggering background cookie refresh");
        let in_flight = InFlightGuard(Arc::clone(&self.refresh_in_flight));
        Some(runtime.spawn(async move {
            let _in_flight = in_flight;
            let result = coordinator.run().await;
            log_refresh_result(&result);
            result
        }))
    }

    /// Run the coordinator once, if one is attached.
    pub async fn startup_check(&self) -> Option<RefreshResult> {
        let coordinator = self.coordinator.as_ref()?;
        info!(platform = %self.platform, "Checking cookie status at startup");
        let result = coordinator.run().await;
        log_refresh_result(&result);
        Some(result)
    }
}

/// Clears the in-flight flag when the refresh task ends, panics included.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn log_refresh_result(result: &RefreshResult) {
    if result.has_updates() {
        warn!(
            cookies = ?result.new_cookies.keys().collect::<Vec<_>>(),
            "Cookies were refreshed, update the configured credentials to keep the session"
        );
    } else {
        debug!(success = result.success, message = %result.message, "Cookie refresh result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_attaches_headers_and_cookies() {
        let interceptor = RequestInterceptor::new("test", Client::new());
        interceptor.set_cookies_from_string("b=2; a=1");
        interceptor.add_cookie("c", "3");

        let request = interceptor.get("http://localhost/x").build().unwrap();
        assert_eq!(
            request.headers().get(header::COOKIE).unwrap(),
            "a=1; b=2; c=3"
        );
        assert_eq!(request.headers().get(header::USER_AGENT).unwrap(), DEFAULT_UA);
    }

    #[test]
    fn test_bilibili_interceptor() {
        let credentials =
            BilibiliCredentials::from_cookie_string("SESSDATA=s; bili_jct=j; refresh_token=rt");
        let interceptor = RequestInterceptor::bilibili(
            Client::new(),
            BilibiliEndpoints::default(),
            credentials,
        )
        .unwrap();

        assert!(interceptor.has_coordinator());
        assert_eq!(interceptor.cookie("SESSDATA").as_deref(), Some("s"));
        assert_eq!(interceptor.cookie("refresh_token"), None);
        assert_eq!(
            interceptor.headers().get(header::REFERER).unwrap(),
            "https://www.bilibili.com"
        );
    }

    #[test]
    fn test_invalid_header_is_configuration_error() {
        let mut interceptor = RequestInterceptor::new("test", Client::new());
        assert!(interceptor.add_header("bad header", "x").unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_auth_failure_without_coordinator_is_noop() {
        let interceptor = RequestInterceptor::new("test", Client::new());
        assert!(interceptor.on_auth_failure(StatusCode::UNAUTHORIZED).is_none());
        assert!(interceptor.startup_check().await.is_none());
    }

    #[tokio::test]
    async fn test_in_flight_flag_cleared_when_refresh_task_panics() {
        let flag = Arc::new(AtomicBool::new(true));
        let guard = InFlightGuard(Arc::clone(&flag));

        let handle = tokio::spawn(async move {
            let _in_flight = guard;
            panic!("coordinator blew up");
        });
        assert!(handle.await.unwrap_err().is_panic());
        assert!(!flag.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_refresh_can_start_again_after_previous_run() {
        let credentials =
            BilibiliCredentials::from_cookie_string("SESSDATA=s; bili_jct=j; refresh_token=rt");
        let interceptor = RequestInterceptor::bilibili(
            Client::new(),
            BilibiliEndpoints::with_base("http://127.0.0.1:9"),
            credentials,
        )
        .unwrap();

        let first = interceptor.on_auth_failure(StatusCode::UNAUTHORIZED).unwrap();
        let _ = first.await;
        assert!(interceptor.on_auth_failure(StatusCode::UNAUTHORIZED).is_some());
    }
}
