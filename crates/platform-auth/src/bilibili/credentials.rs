use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use super::cookie_utils::extract_cookie_value;

pub const SESSDATA: &str = "SESSDATA";
pub const BILI_JCT: &str = "bili_jct";
pub const DEDE_USER_ID: &str = "DedeUserID";
pub const BUVID3: &str = "buvid3";
pub const BUVID4: &str = "buvid4";
/// Pseudo-cookie used to carry the refresh token inside a cookie string.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Web session cookies plus the rotating refresh token.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BilibiliCredentials {
    pub sessdata: Option<String>,
    pub bili_jct: Option<String>,
    pub dede_user_id: Option<String>,
    pub buvid3: Option<String>,
    pub buvid4: Option<String>,
    pub refresh_token: Option<String>,
}

impl BilibiliCredentials {
    /// Read the cookie quintuple and an optional `refresh_token` pseudo-cookie.
    pub fn from_cookie_string(cookies: &str) -> Self {
        let get = |name: &str| {
            extract_cookie_value(cookies, name)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };
        Self {
            sessdata: get(SESSDATA),
            bili_jct: get(BILI_JCT),
            dede_user_id: get(DEDE_USER_ID),
            buvid3: get(BUVID3),
            buvid4: get(BUVID4),
            refresh_token: get(REFRESH_TOKEN_KEY),
        }
    }

    /// Cookie name/value pairs that are set, in header order.
    pub fn cookies(&self) -> Vec<(&'static str, &str)> {
        [
            (SESSDATA, &self.sessdata),
            (BILI_JCT, &self.bili_jct),
            (DEDE_USER_ID, &self.dede_user_id),
            (BUVID3, &self.buvid3),
            (BUVID4, &self.buvid4),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|v| (name, v)))
        .collect()
    }

    /// `Cookie` header value. Never contains the refresh token.
    pub fn cookie_header(&self) -> String {
        self.cookies()
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn csrf(&self) -> Option<&str> {
        self.bili_jct.as_deref()
    }

    pub fn is_logged_in(&self) -> bool {
        self.sessdata.is_some() && self.bili_jct.is_some()
    }

    /// Session cookies and refresh token are all present.
    pub fn can_refresh(&self) -> bool {
        self.is_logged_in() && self.refresh_token.is_some()
    }

    /// Copy with refreshed cookie values and refresh token applied.
    ///
    /// Unknown cookie names are ignored.
    pub fn with_updates(
        &self,
        cookies: &BTreeMap<String, String>,
        refresh_token: Option<&str>,
    ) -> Self {
        let mut next = self.clone();
        for (name, value) in cookies {
            let slot = match name.as_str() {
                SESSDATA => &mut next.sessdata,
                BILI_JCT => &mut next.bili_jct,
                DEDE_USER_ID => &mut next.dede_user_id,
                BUVID3 => &mut next.buvid3,
                BUVID4 => &mut next.buvid4,
                _ => continue,
            };
            *slot = Some(value.clone());
        }
        if let Some(token) = refresh_token {
            next.refresh_token = Some(token.to_string());
        }
        next
    }

    /// Fill missing fields from a raw cookie string.
    pub fn merge_cookie_string(&mut self, cookies: &str) {
        let parsed = Self::from_cookie_string(cookies);
        for (slot, value) in [
            (&mut self.sessdata, parsed.sessdata),
            (&mut self.bili_jct, parsed.bili_jct),
            (&mut self.dede_user_id, parsed.dede_user_id),
            (&mut self.buvid3, parsed.buvid3),
            (&mut self.buvid4, parsed.buvid4),
            (&mut self.refresh_token, parsed.refresh_token),
        ] {
            if slot.is_none() {
                *slot = value;
            }
        }
    }
}

impl fmt::Debug for BilibiliCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BilibiliCredentials")
            .field("dede_user_id", &self.dede_user_id)
            .field("has_sessdata", &self.sessdata.is_some())
            .field("has_bili_jct", &self.bili_jct.is_some())
            .field("has_buvid3", &self.buvid3.is_some())
            .field("has_buvid4", &self.buvid4.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}
