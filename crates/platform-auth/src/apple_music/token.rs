use std::fmt;
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::DateTime;
use regex::Regex;
use serde::Deserialize;

use crate::cache::Expiring;
use crate::error::AuthError;
use crate::token::{Token, TokenKind};

static TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ey[\w-]+\.[\w-]+\.[\w-]+").unwrap());

static MODULE_SCRIPT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<script\s+type="module"\s+crossorigin\s+src="([^"]+)""#).unwrap()
});

// Looser match for when attribute order differs.
static INDEX_SCRIPT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<script[^>]*type="module"[^>]*\ssrc="([^"]*index[^"]*\.js)""#).unwrap()
});

#[derive(Deserialize)]
struct Claims {
    #[serde(default)]
    exp: i64,
    #[serde(default)]
    root_https_origin: Vec<String>,
}

/// A parsed developer token.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaApiToken {
    token: Token,
    origin: Option<String>,
}

impl MediaApiToken {
    /// Decode the JWT payload. The signature is not verified.
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AuthError::Parse("media API token is empty".to_string()));
        }

        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() < 3 {
            return Err(AuthError::Parse(
                "media API token must have 3 parts separated by '.'".to_string(),
            ));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(parts[1].trim_end_matches('='))
            .map_err(|e| AuthError::Parse(format!("failed to decode token payload: {e}")))?;
        let claims: Claims = serde_json::from_slice(&payload)?;

        let expires_at = match claims.exp {
            0 => None,
            exp => Some(DateTime::from_timestamp(exp, 0).ok_or_else(|| {
                AuthError::Parse(format!("token exp {exp} is out of range"))
            })?),
        };

        Ok(Self {
            token: Token::new(TokenKind::MediaApi, raw, expires_at),
            origin: claims.root_https_origin.into_iter().next(),
        })
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn value(&self) -> &str {
        self.token.value()
    }

    /// First `root_https_origin` claim, sent as the `Origin` header.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }
}

impl Expiring for MediaApiToken {
    fn is_fresh(&self) -> bool {
        self.token.is_fresh()
    }
}

impl fmt::Debug for MediaApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaApiToken")
            .field("origin", &self.origin)
            .field("expires_at", &self.token.expires_at())
            .finish()
    }
}

/// Absolute URL of the module script that embeds the token.
pub fn module_script_url(html: &str, origin: &str) -> Option<String> {
    let src = MODULE_SCRIPT_REGEX
        .captures(html)
        .or_else(|| INDEX_SCRIPT_REGEX.captures(html))?
        .get(1)?
        .as_str();

    if src.starts_with("http") {
        Some(src.to_string())
    } else {
        Some(format!("{}{src}", origin.trim_end_matches('/')))
    }
}

/// First JWT-shaped string in a script body.
pub fn extract_token(script: &str) -> Option<&str> {
    TOKEN_REGEX.find(script).map(|m| m.as_str())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;

    pub(crate) fn jwt(payload: &str) -> String {
        format!(
            "eyJhbGciOiJFUzI1NiJ9.{}.c2lnbmF0dXJl",
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn test_parse_payload() {
        let raw = jwt(r#"{"iss":"AMPWebPlay","exp":4102444800,"root_https_origin":["apple.com","music.apple.com"]}"#);
        let token = MediaApiToken::parse(&raw).unwrap();
        assert_eq!(token.origin(), Some("apple.com"));
        assert_eq!(
            token.token().expires_at().map(|t| t.timestamp()),
            Some(4_102_444_800)
        );
        assert_eq!(token.value(), raw);
        assert!(token.is_fresh());
    }

    #[test]
    fn test_parse_without_exp_never_expires() {
        let token = MediaApiToken::parse(&jwt(r#"{"exp":0}"#)).unwrap();
        assert_eq!(token.token().expires_at(), None);
        assert_eq!(token.origin(), None);
        assert!(token.is_fresh());
    }

    #[test]
    fn test_parse_expired() {
        let exp = Utc::now().timestamp() - 60;
        let token = MediaApiToken::parse(&jwt(&format!(r#"{{"exp":{exp}}}"#))).unwrap();
        assert!(!token.is_fresh());
    }

    #[test]
    fn test_parse_rejects_out_of_range_exp() {
        let err = MediaApiToken::parse(&jwt(&format!(r#"{{"exp":{}}}"#, i64::MAX))).unwrap_err();
        assert!(matches!(err, AuthError::Parse(_)));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(MediaApiToken::parse("").is_err());
        assert!(MediaApiToken::parse("only.two").is_err());
        assert!(MediaApiToken::parse("a.!!!.c").is_err());
    }

    #[test]
    fn test_module_script_url() {
        let html = r#"<head><script type="module" crossorigin src="/assets/index-abc.js"></script></head>"#;
        assert_eq!(
            module_script_url(html, "https://music.apple.com").as_deref(),
            Some("https://music.apple.com/assets/index-abc.js")
        );

        let reordered = r#"<script crossorigin type="module" src="https://cdn.example/assets/index~1.js"></script>"#;
        assert_eq!(
            module_script_url(reordered, "https://music.apple.com").as_deref(),
            Some("https://cdn.example/assets/index~1.js")
        );

        assert_eq!(module_script_url("<html></html>", "https://music.apple.com"), None);
    }

    #[test]
    fn test_extract_token() {
        let raw = jwt(r#"{"exp":1}"#);
        let script = format!(r#"const cfg={{token:"{raw}",other:1}};"#);
        assert_eq!(extract_token(&script), Some(raw.as_str()));
        assert_eq!(extract_token("nothing here"), None);
    }
}
