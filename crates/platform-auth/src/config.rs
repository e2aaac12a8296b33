//! Credential configuration, one section per platform.
//!
//! Every field is optional. Loading the configuration is left to the host
//! application; these types only deserialize and convert.

use serde::{Deserialize, Serialize};

use crate::apple_music::AppleMusicEndpoints;
use crate::bilibili::{BilibiliCredentials, BilibiliEndpoints};
use crate::error::AuthError;
use crate::spotify::{SpotifyCredentials, SpotifyEndpoints};

/// Spotify credentials and endpoint overrides
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct SpotifyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// `sp_dc` web session cookie, enables account tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sp_dc: Option<String>,
    /// Token URL used verbatim instead of the TOTP-signed one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_token_endpoint: Option<String>,
    /// Prefer anonymous tokens even with client credentials (default: false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefer_anonymous: Option<bool>,
    /// Root for every Spotify endpoint, for proxies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl SpotifyConfig {
    pub fn credentials(&self) -> SpotifyCredentials {
        SpotifyCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            sp_dc: self.sp_dc.clone(),
            custom_token_endpoint: self.custom_token_endpoint.clone(),
            prefer_anonymous: self.prefer_anonymous.unwrap_or(false),
        }
    }

    pub fn endpoints(&self) -> SpotifyEndpoints {
        self.base_url
            .as_deref()
            .map(SpotifyEndpoints::with_base)
            .unwrap_or_default()
    }
}

/// Bilibili web session
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct BilibiliConfig {
    /// Raw cookie string; explicit fields below take precedence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookies: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessdata: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bili_jct: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dede_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buvid3: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buvid4: Option<String>,
    /// Rotating refresh token from the web login (`ac_time_value`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Check cookie status once at startup (default: true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_on_startup: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl BilibiliConfig {
    pub fn credentials(&self) -> BilibiliCredentials {
        let mut credentials = BilibiliCredentials {
            sessdata: self.sessdata.clone(),
            bili_jct: self.bili_jct.clone(),
            dede_user_id: self.dede_user_id.clone(),
            buvid3: self.buvid3.clone(),
            buvid4: self.buvid4.clone(),
            refresh_token: self.refresh_token.clone(),
        };
        if let Some(cookies) = &self.cookies {
            credentials.merge_cookie_string(cookies);
        }
        credentials
    }

    pub fn endpoints(&self) -> BilibiliEndpoints {
        self.base_url
            .as_deref()
            .map(BilibiliEndpoints::with_base)
            .unwrap_or_default()
    }

    pub fn refresh_on_startup(&self) -> bool {
        self.refresh_on_startup.unwrap_or(true)
    }
}

/// Apple Music developer token
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AppleMusicConfig {
    /// Manually supplied token; auto-fetch is used when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_api_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl AppleMusicConfig {
    pub fn endpoints(&self) -> AppleMusicEndpoints {
        self.base_url
            .as_deref()
            .map(AppleMusicEndpoints::with_base)
            .unwrap_or_default()
    }
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub spotify: SpotifyConfig,
    #[serde(default)]
    pub bilibili: BilibiliConfig,
    #[serde(default)]
    pub apple_music: AppleMusicConfig,
}

impl AuthConfig {
    pub fn from_json_str(s: &str) -> Result<Self, AuthError> {
        serde_json::from_str(s)
            .map_err(|e| AuthError::Configuration(format!("invalid auth config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config = AuthConfig::from_json_str(
            r#"{"spotify":{"client_id":"id","client_secret":"secret","prefer_anonymous":true}}"#,
        )
        .unwrap();

        let credentials = config.spotify.credentials();
        assert!(credentials.has_client_credentials());
        assert!(credentials.prefer_anonymous);
        assert_eq!(config.spotify.endpoints().token, crate::spotify::urls::TOKEN);
        assert!(config.bilibili.refresh_on_startup());
        assert!(config.apple_music.media_api_token.is_none());
    }

    #[test]
    fn test_bilibili_cookie_string_and_fields() {
        let config = AuthConfig::from_json_str(
            r#"{"bilibili":{"cookies":"SESSDATA=s; bili_jct=cookie_jct","bili_jct":"field_jct","refresh_token":"rt","base_url":"http://127.0.0.1:8080/"}}"#,
        )
        .unwrap();

        let credentials = config.bilibili.credentials();
        assert_eq!(credentials.sessdata.as_deref(), Some("s"));
        assert_eq!(credentials.csrf(), Some("field_jct"));
        assert!(credentials.can_refresh());
        assert_eq!(
            config.bilibili.endpoints().cookie_info,
            "http://127.0.0.1:8080/x/passport-login/web/cookie/info"
        );
    }

    #[test]
    fn test_invalid_config_is_configuration_error() {
        let err = AuthConfig::from_json_str(r#"{"spotify":{"prefer_anonymous":"yes"}}"#).err().expect("expected an error");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_serialization_skips_unset_fields() {
        let config = AuthConfig::default();
        assert_eq!(
            serde_json::to_string(&config).unwrap(),
            r#"{"spotify":{},"bilibili":{},"apple_music":{}}"#
        );
    }
}
