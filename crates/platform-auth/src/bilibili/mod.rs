//! Bilibili web credentials: WBI request signing and the cookie refresh handshake.

pub mod cookie_refresh;
pub mod cookie_utils;
mod credentials;
pub mod wbi;

pub use cookie_refresh::{CookieRefreshCoordinator, CookieRefreshError, CookieStatus, RefreshResult};
pub use credentials::BilibiliCredentials;
pub use wbi::{MixinKey, WbiSigner};

/// Default API URLs.
pub mod urls {
    pub const BASE_URL: &str = "https://www.bilibili.com";
    /// Carries the WBI key fragments.
    pub const NAV: &str = "https://api.bilibili.com/x/web-interface/nav";
    pub const COOKIE_INFO: &str = "https://passport.bilibili.com/x/passport-login/web/cookie/info";
    /// Correspond path is appended directly.
    pub const CORRESPOND: &str = "https://www.bilibili.com/correspond/1/";
    pub const REFRESH: &str = "https://passport.bilibili.com/x/passport-login/web/cookie/refresh";
    pub const CONFIRM: &str = "https://passport.bilibili.com/x/passport-login/web/confirm/refresh";
}

#[derive(Debug, Clone)]
pub struct BilibiliEndpoints {
    pub nav: String,
    pub cookie_info: String,
    pub correspond: String,
    pub refresh: String,
    pub confirm: String,
    /// Sent as `Referer` on API calls.
    pub referer: String,
}

impl Default for BilibiliEndpoints {
    fn default() -> Self {
        Self {
            nav: urls::NAV.to_string(),
            cookie_info: urls::COOKIE_INFO.to_string(),
            correspond: urls::CORRESPOND.to_string(),
            refresh: urls::REFRESH.to_string(),
            confirm: urls::CONFIRM.to_string(),
            referer: urls::BASE_URL.to_string(),
        }
    }
}

impl BilibiliEndpoints {
    /// Every endpoint rooted at `base`, keeping the default paths.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            nav: format!("{base}/x/web-interface/nav"),
            cookie_info: format!("{base}/x/passport-login/web/cookie/info"),
            correspond: format!("{base}/correspond/1/"),
            refresh: format!("{base}/x/passport-login/web/cookie/refresh"),
            confirm: format!("{base}/x/passport-login/web/confirm/refresh"),
            referer: base.to_string(),
        }
    }
}
