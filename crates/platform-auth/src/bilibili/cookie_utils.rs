//! Cookie string helpers for the refresh handshake.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::header::{HeaderMap, SET_COOKIE};

static REFRESH_CSRF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<div id="1-name">\s*([^<]*?)\s*</div>"#).unwrap());

/// Cookies that lead a rebuilt cookie header.
const PRIORITY_COOKIES: [&str; 4] = ["SESSDATA", "bili_jct", "DedeUserID", "DedeUserID__ckMd5"];

/// Iterate `name=value` pairs of a `Cookie` header string.
pub fn cookie_pairs(cookies: &str) -> impl Iterator<Item = (&str, &str)> {
    cookies
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .filter(|(name, _)| !name.is_empty())
}

/// Extract a specific cookie value from a cookie string.
///
/// ```
/// use platform_auth::bilibili::cookie_utils::extract_cookie_value;
///
/// let cookies = "SESSDATA=abc123; bili_jct=xyz789";
/// assert_eq!(extract_cookie_value(cookies, "bili_jct"), Some("xyz789"));
/// ```
pub fn extract_cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookie_pairs(cookies).find(|(k, _)| *k == name).map(|(_, v)| v)
}

/// Extract `refresh_csrf` from the correspond page, the content of `<div id="1-name">`.
pub fn extract_refresh_csrf(html: &str) -> Option<String> {
    REFRESH_CSRF_REGEX
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|csrf| !csrf.is_empty())
}

/// Name/value of every `Set-Cookie` header. Later headers win.
pub fn parse_set_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|kv| kv.trim().split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Apply `updates` on top of `original`, priority cookies first.
pub fn merge_cookies(original: &str, updates: &BTreeMap<String, String>) -> String {
    let mut merged: BTreeMap<&str, &str> = cookie_pairs(original).collect();
    for (name, value) in updates {
        merged.insert(name.as_str(), value.as_str());
    }

    let mut result = Vec::with_capacity(merged.len());
    for name in PRIORITY_COOKIES {
        if let Some(value) = merged.remove(name) {
            result.push(format!("{name}={value}"));
        }
    }
    result.extend(merged.into_iter().map(|(k, v)| format!("{k}={v}")));
    result.join("; ")
}
